pub mod afk;
pub mod focus;
pub mod llm_client;
pub mod monitors;
pub mod ocr;
pub mod reports;
pub mod screenshot;
pub mod session;
pub mod summarizer;
pub mod window_info;
