//! 单调时钟
//!
//! 调度器使用的唯一时间源：进程内单调毫秒时间戳

use std::sync::OnceLock;
use std::time::Instant;

static CLOCK_EPOCH: OnceLock<Instant> = OnceLock::new();

/// 获取当前单调毫秒时间戳
///
/// 以首次调用为基准，只增不减
pub fn now_ms() -> u64 {
    CLOCK_EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// 计算 ms 毫秒后的绝对时间戳
pub fn after_ms(ms: u64) -> u64 {
    now_ms().saturating_add(ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_now_ms_monotonic() {
        let a = now_ms();
        thread::sleep(Duration::from_millis(5));
        let b = now_ms();
        assert!(b >= a + 5);
    }

    #[test]
    fn test_after_ms() {
        let deadline = after_ms(100);
        assert!(deadline >= now_ms());
        assert!(deadline > now_ms() + 50);
    }
}
