pub mod chunked;
pub mod date;
pub mod http_value;
pub mod meta;
pub mod start_line;

pub use http_value::{HttpMethod, HttpVersion, StatusCode};
pub use meta::{HeaderMap, ParseLimits};
pub use start_line::{RequestStartLine, StatusStartLine};
