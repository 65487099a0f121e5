pub mod cache;
pub mod logger;
pub mod paging;
