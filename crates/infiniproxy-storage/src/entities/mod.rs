pub mod api_keys;
pub mod backend_services;
pub mod usage_records;
pub mod users;

pub use api_keys::Entity as ApiKeys;
pub use backend_services::Entity as BackendServices;
pub use usage_records::Entity as UsageRecords;
pub use users::Entity as Users;
