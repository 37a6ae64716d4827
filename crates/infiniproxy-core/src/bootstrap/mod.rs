use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use infiniproxy_common::{GlobalConfig, GlobalConfigPatch};
use infiniproxy_provider_core::{BackendService, ModelResolver, TracingUsageSink, UsageFanout};
use infiniproxy_storage::SeaOrmStorage;
use infiniproxy_transform::TranslatorConfig;

use crate::auth::Authenticator;
use crate::core::{Core, CoreState};
use crate::invoker::CompletionInvoker;
use crate::upstream_client::{UpstreamClient, UpstreamClientConfig, WreqUpstreamClient};

#[derive(Debug, Clone, Default, Parser)]
#[command(
    name = "infiniproxy",
    version,
    about = "Messages-to-chat/completions gateway with backend routing"
)]
pub struct CliArgs {
    /// Bind host.
    #[arg(long, env = "PROXY_HOST")]
    pub host: Option<String>,

    /// Bind port.
    #[arg(long, env = "PROXY_PORT")]
    pub port: Option<String>,

    /// Registry / api key / usage database DSN.
    #[arg(long, env = "INFINIPROXY_DSN")]
    pub dsn: Option<String>,

    /// Chat/completions endpoint of the static fallback backend.
    #[arg(long, env = "OPENAI_BASE_URL")]
    pub base_url: Option<String>,

    /// Credential of the static fallback backend.
    #[arg(long, env = "OPENAI_API_KEY")]
    pub api_key: Option<String>,

    /// System-wide default model.
    #[arg(long, env = "OPENAI_MODEL")]
    pub model: Option<String>,

    /// Per backend request timeout, seconds.
    #[arg(long, env = "TIMEOUT")]
    pub timeout: Option<String>,

    #[arg(long, env = "MAX_INPUT_TOKENS")]
    pub max_input_tokens: Option<String>,

    #[arg(long, env = "MAX_OUTPUT_TOKENS")]
    pub max_output_tokens: Option<String>,

    #[arg(long, env = "DEBUG")]
    pub debug: Option<String>,

    /// Reject requests without a known api key.
    #[arg(long, env = "INFINIPROXY_REQUIRE_API_KEY")]
    pub require_api_key: Option<String>,
}

pub struct Bootstrap {
    pub config: GlobalConfig,
    pub storage: Arc<SeaOrmStorage>,
    pub core: Core,
}

/// CLI beats ENV (clap), both beat the built-in defaults applied by `into_config`.
pub fn load_config(args: CliArgs) -> anyhow::Result<GlobalConfig> {
    let mut merged = GlobalConfigPatch {
        dsn: Some(default_dsn()),
        ..Default::default()
    };

    let cli_patch = GlobalConfigPatch {
        host: sanitize_optional_env_value(args.host),
        port: parse_env_value(args.port, "PROXY_PORT")?,
        dsn: sanitize_optional_env_value(args.dsn),
        fallback_base_url: sanitize_optional_env_value(args.base_url),
        fallback_api_key: sanitize_optional_env_value(args.api_key),
        default_model: sanitize_optional_env_value(args.model),
        timeout_secs: parse_env_value(args.timeout, "TIMEOUT")?,
        max_input_tokens: parse_env_value(args.max_input_tokens, "MAX_INPUT_TOKENS")?,
        max_output_tokens: parse_env_value(args.max_output_tokens, "MAX_OUTPUT_TOKENS")?,
        debug: parse_bool_env_value(args.debug, "DEBUG")?,
        require_api_key: parse_bool_env_value(
            args.require_api_key,
            "INFINIPROXY_REQUIRE_API_KEY",
        )?,
    };
    merged.overlay(cli_patch);

    merged
        .into_config()
        .context("finalize merged global config")
}

pub async fn bootstrap(config: GlobalConfig) -> anyhow::Result<Bootstrap> {
    ensure_sqlite_parent_dir(&config.dsn)?;

    let storage = Arc::new(
        SeaOrmStorage::connect(&config.dsn)
            .await
            .context("connect storage")?,
    );
    storage.sync().await.context("schema sync")?;

    if config.require_api_key
        && storage
            .count_api_keys()
            .await
            .context("count api keys")?
            == 0
    {
        let user_id = storage
            .create_user("default")
            .await
            .context("create default user")?;
        let issued = storage
            .create_api_key(user_id, Some("bootstrap"))
            .await
            .context("create bootstrap api key")?;
        eprintln!("generated api key: {}", issued.api_key);
    }

    let client = Arc::new(WreqUpstreamClient::new(UpstreamClientConfig::from_global(
        &config,
    )));
    let core = build_core(&config, storage.clone(), client);

    Ok(Bootstrap {
        config,
        storage,
        core,
    })
}

/// Wires the gateway around an already synced store.
pub fn build_core(
    config: &GlobalConfig,
    storage: Arc<SeaOrmStorage>,
    client: Arc<dyn UpstreamClient>,
) -> Core {
    let fallback_backend = BackendService::fallback(
        config.fallback_base_url.as_str(),
        config.fallback_api_key.as_str(),
        config.default_model.as_str(),
    );
    let usage = UsageFanout::new()
        .with_sink(Arc::new(TracingUsageSink))
        .with_sink(storage.clone());

    Core::new(CoreState {
        resolver: ModelResolver::new(
            storage.clone(),
            fallback_backend,
            config.default_model.clone(),
        ),
        invoker: CompletionInvoker::new(client),
        auth: Authenticator::new(storage, config.require_api_key),
        usage: Arc::new(usage),
        translator: TranslatorConfig {
            default_model: config.default_model.clone(),
            max_input_tokens: config.max_input_tokens,
            max_output_tokens: config.max_output_tokens,
        },
    })
}

fn sanitize_optional_env_value(value: Option<String>) -> Option<String> {
    let trimmed = value?.trim().to_string();
    if trimmed.is_empty() {
        return None;
    }
    // unresolved `${VAR}` placeholders from deployment templates
    if trimmed.starts_with("${") && trimmed.ends_with('}') {
        return None;
    }
    Some(trimmed)
}

fn default_dsn() -> String {
    if let Some(data_dir) =
        sanitize_optional_env_value(std::env::var("INFINIPROXY_DATA_DIR").ok())
    {
        let dir = data_dir.trim_end_matches('/');
        return format!("sqlite://{dir}/infiniproxy.db?mode=rwc");
    }
    "sqlite://infiniproxy.db?mode=rwc".to_string()
}

fn ensure_sqlite_parent_dir(dsn: &str) -> anyhow::Result<()> {
    let Some(db_path) = sqlite_file_path_from_dsn(dsn) else {
        return Ok(());
    };
    let Some(parent) = db_path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }

    std::fs::create_dir_all(parent)
        .with_context(|| format!("create sqlite parent dir {}", parent.display()))?;
    Ok(())
}

fn sqlite_file_path_from_dsn(dsn: &str) -> Option<PathBuf> {
    let rest = dsn.strip_prefix("sqlite:")?;
    let path_part = rest.split(['?', '#']).next()?.trim();
    let normalized = path_part.strip_prefix("//").unwrap_or(path_part);
    if normalized.is_empty() || normalized.eq_ignore_ascii_case(":memory:") {
        return None;
    }
    Some(PathBuf::from(normalized))
}

fn parse_env_value<T>(value: Option<String>, env_name: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let Some(raw) = sanitize_optional_env_value(value) else {
        return Ok(None);
    };
    let parsed = raw
        .parse::<T>()
        .with_context(|| format!("invalid {env_name} value: {raw}"))?;
    Ok(Some(parsed))
}

fn parse_bool_env_value(value: Option<String>, env_name: &str) -> anyhow::Result<Option<bool>> {
    let Some(raw) = sanitize_optional_env_value(value) else {
        return Ok(None);
    };
    let parsed = match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => return Err(anyhow::anyhow!("invalid {env_name} value: {raw}")),
    };
    Ok(Some(parsed))
}
