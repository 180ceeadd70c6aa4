// See <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

pub mod batch;
pub mod http;
pub mod loader;
pub mod preload;
pub mod utils;

pub use utils::*;
