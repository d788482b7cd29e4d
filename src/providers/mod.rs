pub mod scraper;
pub mod util;

pub use scraper::ScraperSource;
