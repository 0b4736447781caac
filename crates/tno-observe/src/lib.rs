mod logger;
pub use logger::*;

#[cfg(any(test, feature = "capture"))]
pub mod capture;
