pub mod claude2openai_chat_completions;
