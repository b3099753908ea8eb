pub mod cleaner;
pub mod fetcher;
pub mod llm;

pub use cleaner::HtmlCleaner;
pub use fetcher::ReqwestFetcher;
pub use llm::OpenAiRecipeGenerator;
