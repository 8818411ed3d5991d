//! Shared helpers: text normalization and the injectable clock

pub mod clock;
pub mod text_utils;

pub use clock::{Clock, ManualClock, SystemClock};
pub use text_utils::TextUtils;
