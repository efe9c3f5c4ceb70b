pub mod context;
pub mod logging;
pub mod url;
