//! 配置常量模块
//!
//! 所有可调整的运行时常量都在这里定义，便于后期修改

/// 协程栈大小：128KB
pub const STACK_SIZE: usize = 128 * 1024;

/// 驱动循环空转时的休眠时长（毫秒）
pub const IDLE_SLEEP_MS: u64 = 10;

/// 版本号
#[allow(dead_code)]
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
