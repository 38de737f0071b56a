//! 协程对象
//!
//! 每个协程独占一块固定大小的栈和一份保存的执行上下文，
//! 并携带轮转调度所需的挂起元数据（让出轮数、唤醒时刻、父子关系）

use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use parking_lot::Mutex;

use super::reporter::{ReporterBase, SonResult};
use super::{ChroutineId, INVALID_ID};
use crate::config::STACK_SIZE;

/// 协程入口参数，创建方传入的不透明数据
pub type ChroutineArg = Option<Arc<dyn Any + Send + Sync>>;

/// 协程工作函数，至多被消费一次
pub type ChroutineFn = Box<dyn FnOnce(ChroutineArg) + Send + 'static>;

/// 协程保存的执行上下文
type ExecContext = Coroutine<(), (), ()>;

/// 协程状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChroutineState {
    /// 就绪，等待被调度
    Ready = 0,
    /// 正在运行
    Running = 1,
    /// 挂起（让出、定时等待或等待子协程）
    Suspend = 2,
    /// 已结束
    Finished = 3,
}

impl From<u8> for ChroutineState {
    fn from(v: u8) -> Self {
        match v {
            0 => ChroutineState::Ready,
            1 => ChroutineState::Running,
            2 => ChroutineState::Suspend,
            _ => ChroutineState::Finished,
        }
    }
}

/// 栈分配或上下文初始化失败
#[derive(Debug, Clone)]
pub struct CreateError;

impl fmt::Display for CreateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chroutine stack allocation failed")
    }
}

impl std::error::Error for CreateError {}

thread_local! {
    /// 当前正在运行的协程的 Yielder 指针
    ///
    /// 进入协程体时写入，挂起原语经由它切回宿主上下文。
    /// 指针仅在该协程本次运行期间有效
    static CURRENT_YIELDER: Cell<Option<*const ()>> = const { Cell::new(None) };
}

/// 挂起当前协程，切回宿主上下文
///
/// 只能在协程体内调用；恢复执行后重新安装 Yielder，
/// 因为挂起期间同线程可能运行过其他协程
pub(crate) fn suspend_current() {
    CURRENT_YIELDER.with(|c| {
        let ptr = c
            .get()
            .expect("suspend_current called outside of a chroutine");
        let yielder: &Yielder<(), ()> = unsafe { &*(ptr as *const Yielder<(), ()>) };
        yielder.suspend(());
        c.set(Some(ptr));
    });
}

/// 清除本线程的 Yielder 记录，由调度器在切回后调用
pub(crate) fn clear_current_yielder() {
    CURRENT_YIELDER.with(|c| c.set(None));
}

/// 协程
///
/// 调度器通过 `Arc` 共享持有；挂起元数据全部为原子标量，
/// 只有拥有它的工作线程会恢复其执行
pub struct Chroutine {
    /// 协程唯一 ID
    pub id: ChroutineId,
    /// 协程状态
    state: AtomicU8,
    /// 执行上下文，迁移时被整体取走，留下可析构的空壳
    coro: Mutex<Option<ExecContext>>,
    /// 剩余需要跳过的调度轮数
    yield_wait: AtomicI32,
    /// 绝对唤醒时间戳（毫秒），0 表示没有定时等待
    yield_to: AtomicU64,
    /// 父协程 ID
    father: AtomicU64,
    /// 子协程 ID
    son: AtomicU64,
    /// 与子协程共享的回报器
    reporter: Mutex<Option<Arc<dyn ReporterBase>>>,
    /// 定时等待到期时是否终止子协程
    stop_son_when_yield_over: AtomicBool,
    /// 迁移标记，栈已转移到其他工作线程
    moved: AtomicBool,
}

impl Chroutine {
    /// 创建新协程
    ///
    /// 分配栈并构造执行上下文；工作函数在首次恢复时才开始执行
    pub fn new(id: ChroutineId, func: ChroutineFn, arg: ChroutineArg) -> Result<Self, CreateError> {
        let stack = DefaultStack::new(STACK_SIZE).map_err(|_| CreateError)?;
        let coro = Coroutine::with_stack(stack, move |yielder: &Yielder<(), ()>, _input: ()| {
            CURRENT_YIELDER.with(|c| {
                c.set(Some(yielder as *const Yielder<(), ()> as *const ()));
            });
            func(arg);
        });

        Ok(Self {
            id,
            state: AtomicU8::new(ChroutineState::Ready as u8),
            coro: Mutex::new(Some(coro)),
            yield_wait: AtomicI32::new(0),
            yield_to: AtomicU64::new(0),
            father: AtomicU64::new(INVALID_ID),
            son: AtomicU64::new(INVALID_ID),
            reporter: Mutex::new(None),
            stop_son_when_yield_over: AtomicBool::new(false),
            moved: AtomicBool::new(false),
        })
    }

    /// 从迁出方取走执行上下文和挂起元数据，构造接收方的新协程对象
    ///
    /// 迁出方留下空壳；空壳返回 None
    pub(crate) fn resettle_from(other: &Chroutine) -> Option<Chroutine> {
        let coro = other.coro.lock().take()?;
        Some(Chroutine {
            id: other.id,
            state: AtomicU8::new(other.state.load(Ordering::Acquire)),
            coro: Mutex::new(Some(coro)),
            yield_wait: AtomicI32::new(other.yield_wait.load(Ordering::Relaxed)),
            yield_to: AtomicU64::new(other.yield_to.load(Ordering::Relaxed)),
            father: AtomicU64::new(other.father.load(Ordering::Relaxed)),
            son: AtomicU64::new(other.son.load(Ordering::Relaxed)),
            reporter: Mutex::new(other.reporter.lock().clone()),
            stop_son_when_yield_over: AtomicBool::new(
                other.stop_son_when_yield_over.load(Ordering::Relaxed),
            ),
            moved: AtomicBool::new(false),
        })
    }

    /// 恢复执行，直到协程再次挂起或运行结束
    pub(crate) fn resume(&self) -> CoroutineResult<(), ()> {
        let mut cell = self.coro.lock();
        match cell.as_mut() {
            Some(coro) => coro.resume(()),
            // 空壳无事可做，按已结束处理
            None => CoroutineResult::Return(()),
        }
    }

    /// 获取协程状态
    #[inline]
    pub fn state(&self) -> ChroutineState {
        ChroutineState::from(self.state.load(Ordering::Acquire))
    }

    /// 设置协程状态
    #[inline]
    pub fn set_state(&self, state: ChroutineState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// 调度检查：本轮是否仍需跳过
    ///
    /// `yield_wait` 大于 0 时自减并返回旧值（非零表示跳过本轮）；
    /// 否则若未到定时唤醒时刻返回 1；可运行返回 0。
    /// 仅拥有该协程的调度线程会调用，自减无需原子读改写
    pub fn wait(&self, now: u64) -> i32 {
        let w = self.yield_wait.load(Ordering::Relaxed);
        if w > 0 {
            self.yield_wait.store(w - 1, Ordering::Relaxed);
            return w;
        }

        let to = self.yield_to.load(Ordering::Relaxed);
        if to != 0 && to > now {
            return 1;
        }

        0
    }

    /// 定时等待结束，由调度器在恢复本协程前调用
    ///
    /// 若定时等待要求终止子协程：写入结果并返回待终止的子协程 ID。
    /// 无论哪个分支都会清除定时等待
    pub fn yield_over(&self, result: SonResult) -> ChroutineId {
        let mut timeout_son = INVALID_ID;
        if self.yield_to.load(Ordering::Relaxed) != 0
            && self.stop_son_when_yield_over.load(Ordering::Relaxed)
        {
            if let Some(reporter) = self.reporter.lock().as_ref() {
                reporter.set_result(result);
            }
            timeout_son = self.son.swap(INVALID_ID, Ordering::Relaxed);
            self.stop_son_when_yield_over.store(false, Ordering::Relaxed);
        }

        self.yield_to.store(0, Ordering::Relaxed);
        timeout_son
    }

    /// 子协程正常结束：写入 Done 并让本协程立即可运行
    pub fn son_finished(&self) {
        if let Some(reporter) = self.reporter.lock().as_ref() {
            reporter.set_result(SonResult::Done);
        }
        self.yield_to.store(0, Ordering::Relaxed);
    }

    /// 子协程异常退出：写入 Error 并让本协程立即可运行
    pub fn son_faulted(&self) {
        if let Some(reporter) = self.reporter.lock().as_ref() {
            reporter.set_result(SonResult::Error);
        }
        self.yield_to.store(0, Ordering::Relaxed);
    }

    /// 追加需要跳过的调度轮数
    #[inline]
    pub(crate) fn add_yield_wait(&self, tick: i32) {
        self.yield_wait.fetch_add(tick, Ordering::Relaxed);
    }

    /// 获取定时唤醒时间戳
    #[inline]
    pub fn yield_to(&self) -> u64 {
        self.yield_to.load(Ordering::Relaxed)
    }

    /// 设置定时唤醒时间戳
    #[inline]
    pub(crate) fn set_yield_to(&self, deadline: u64) {
        self.yield_to.store(deadline, Ordering::Relaxed);
    }

    /// 设置定时等待到期时是否终止子协程
    #[inline]
    pub(crate) fn set_stop_son(&self, stop: bool) {
        self.stop_son_when_yield_over.store(stop, Ordering::Relaxed);
    }

    /// 获取父协程 ID
    #[inline]
    pub fn father(&self) -> ChroutineId {
        self.father.load(Ordering::Relaxed)
    }

    /// 设置父协程 ID
    #[inline]
    pub(crate) fn set_father(&self, id: ChroutineId) {
        self.father.store(id, Ordering::Relaxed);
    }

    /// 获取子协程 ID
    #[inline]
    pub fn son(&self) -> ChroutineId {
        self.son.load(Ordering::Relaxed)
    }

    /// 设置子协程 ID
    #[inline]
    pub(crate) fn set_son(&self, id: ChroutineId) {
        self.son.store(id, Ordering::Relaxed);
    }

    /// 设置回报器
    pub(crate) fn set_reporter(&self, reporter: Arc<dyn ReporterBase>) {
        *self.reporter.lock() = Some(reporter);
    }

    /// 获取回报器
    pub fn reporter(&self) -> Option<Arc<dyn ReporterBase>> {
        self.reporter.lock().clone()
    }

    /// 检查迁移标记
    #[inline]
    pub fn has_moved(&self) -> bool {
        self.moved.load(Ordering::Acquire)
    }

    /// 设置迁移标记
    #[inline]
    pub(crate) fn set_moved(&self, moved: bool) {
        self.moved.store(moved, Ordering::Release);
    }
}

impl fmt::Debug for Chroutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chroutine")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("father", &self.father())
            .field("son", &self.son())
            .finish()
    }
}

// 协程可以在线程间转移：执行上下文只会被拥有它的工作线程恢复，
// 跨线程转移仅发生在协程挂起于切换点期间（迁移协议）
unsafe impl Send for Chroutine {}
unsafe impl Sync for Chroutine {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::clock;
    use crate::runtime::reporter::Reporter;
    use std::sync::atomic::AtomicU32;

    fn make_chroutine(id: ChroutineId, func: ChroutineFn) -> Chroutine {
        Chroutine::new(id, func, None).unwrap()
    }

    #[test]
    fn test_new_chroutine_ready() {
        let c = make_chroutine(1, Box::new(|_| {}));
        assert_eq!(c.state(), ChroutineState::Ready);
        assert_eq!(c.father(), INVALID_ID);
        assert_eq!(c.son(), INVALID_ID);
        assert!(!c.has_moved());
    }

    #[test]
    fn test_resume_to_completion() {
        let counter = Arc::new(AtomicU32::new(0));
        let n = Arc::clone(&counter);
        let c = make_chroutine(1, Box::new(move |_| {
            n.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(matches!(c.resume(), CoroutineResult::Return(())));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        clear_current_yielder();
    }

    #[test]
    fn test_suspend_and_resume() {
        let counter = Arc::new(AtomicU32::new(0));
        let n = Arc::clone(&counter);
        let c = make_chroutine(1, Box::new(move |_| {
            n.fetch_add(1, Ordering::SeqCst);
            suspend_current();
            n.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(matches!(c.resume(), CoroutineResult::Yield(())));
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        assert!(matches!(c.resume(), CoroutineResult::Return(())));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        clear_current_yielder();
    }

    #[test]
    fn test_arg_passed_to_entry() {
        let got = Arc::new(AtomicU32::new(0));
        let g = Arc::clone(&got);
        let arg: ChroutineArg = Some(Arc::new(17u32));
        let c = Chroutine::new(
            1,
            Box::new(move |arg| {
                let v = arg.unwrap().downcast::<u32>().unwrap();
                g.store(*v, Ordering::SeqCst);
            }),
            arg,
        )
        .unwrap();

        c.resume();
        assert_eq!(got.load(Ordering::SeqCst), 17);
        clear_current_yielder();
    }

    #[test]
    fn test_wait_tick_countdown() {
        let c = make_chroutine(1, Box::new(|_| {}));
        c.add_yield_wait(2);

        // 返回旧值并自减，归零后可运行
        assert_eq!(c.wait(0), 2);
        assert_eq!(c.wait(0), 1);
        assert_eq!(c.wait(0), 0);
    }

    #[test]
    fn test_wait_deadline() {
        let c = make_chroutine(1, Box::new(|_| {}));
        let now = clock::now_ms();
        c.set_yield_to(now + 50);

        assert_eq!(c.wait(now), 1);
        assert_eq!(c.wait(now + 49), 1);
        assert_eq!(c.wait(now + 50), 0);
    }

    #[test]
    fn test_yield_over_stops_son() {
        let c = make_chroutine(1, Box::new(|_| {}));
        let reporter = Reporter::<i32>::new();
        c.set_reporter(reporter.clone());
        c.set_son(42);
        c.set_yield_to(5);
        c.set_stop_son(true);

        assert_eq!(c.yield_over(SonResult::Timeout), 42);
        assert_eq!(reporter.result(), SonResult::Timeout);
        assert_eq!(c.son(), INVALID_ID);
        assert_eq!(c.yield_to(), 0);

        // 再次调用不再有待终止的子协程
        assert_eq!(c.yield_over(SonResult::Timeout), INVALID_ID);
    }

    #[test]
    fn test_yield_over_without_stop_son() {
        let c = make_chroutine(1, Box::new(|_| {}));
        let reporter = Reporter::<i32>::new();
        c.set_reporter(reporter.clone());
        c.set_son(42);
        c.set_yield_to(5);

        assert_eq!(c.yield_over(SonResult::Timeout), INVALID_ID);
        assert!(reporter.is_pending());
        assert_eq!(c.son(), 42);
        assert_eq!(c.yield_to(), 0);
    }

    #[test]
    fn test_son_finished() {
        let c = make_chroutine(1, Box::new(|_| {}));
        let reporter = Reporter::<i32>::new();
        c.set_reporter(reporter.clone());
        c.set_yield_to(9999);

        c.son_finished();
        assert_eq!(reporter.result(), SonResult::Done);
        assert_eq!(c.yield_to(), 0);
    }

    #[test]
    fn test_son_faulted() {
        let c = make_chroutine(1, Box::new(|_| {}));
        let reporter = Reporter::<i32>::new();
        c.set_reporter(reporter.clone());
        c.set_yield_to(9999);

        c.son_faulted();
        assert_eq!(reporter.result(), SonResult::Error);
        assert_eq!(c.yield_to(), 0);
    }

    #[test]
    fn test_resettle_from_moves_context() {
        let counter = Arc::new(AtomicU32::new(0));
        let n = Arc::clone(&counter);
        let src = make_chroutine(7, Box::new(move |_| {
            n.fetch_add(1, Ordering::SeqCst);
        }));
        src.set_yield_to(12345);
        src.set_father(3);
        src.set_moved(true);

        let moved = Chroutine::resettle_from(&src).unwrap();
        assert_eq!(moved.id, 7);
        assert_eq!(moved.yield_to(), 12345);
        assert_eq!(moved.father(), 3);
        assert!(!moved.has_moved());

        // 源变为空壳，再次取走失败
        assert!(Chroutine::resettle_from(&src).is_none());

        // 上下文随对象转移，仍可恢复执行
        assert!(matches!(moved.resume(), CoroutineResult::Return(())));
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // 空壳恢复按已结束处理
        assert!(matches!(src.resume(), CoroutineResult::Return(())));
        clear_current_yielder();
    }
}
