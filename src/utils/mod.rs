pub mod logging;

use chrono::Utc;

/// Logical timestamp used for `updated_at` and change stamps: epoch millis.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
