pub mod anthropic;
pub mod apikey;
pub mod credential;
pub mod kiro;
pub mod openai;
