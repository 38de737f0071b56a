//! 工作线程
//!
//! 每个工作线程拥有一份本地调度表（协程表、轮转序列、游标、延迟释放表），
//! 在自己的执行上下文上逐个恢复协程，并在每轮调度之间轮询注册的可轮询对象。
//! 协程间的切换完全协作式：协程让出、定时等待或运行结束时切回宿主上下文

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use corosensei::CoroutineResult;
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use tracing::{debug, error, info, trace};

use super::chroutine::{self, Chroutine, ChroutineArg, ChroutineFn, ChroutineState};
use super::clock;
use super::engine::WorkerPool;
use super::reporter::{Reporter, ReporterBase, SonResult};
use super::selector::Selectable;
use super::{gen_chroutine_id, ChroutineId, INVALID_ID};
use crate::config::IDLE_SLEEP_MS;

/// 工作线程状态
///
/// 状态只会沿枚举顺序前进；超过 Running 之后拒绝创建新协程
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum WorkerState {
    /// 已创建，驱动循环未启动
    Init = 0,
    /// 驱动循环运行中
    Running = 1,
    /// 正在向其他线程迁出协程
    Shifting = 2,
    /// 迁出完成，等待停止
    Blocking = 3,
    /// 驱动循环已退出
    Finished = 4,
}

impl From<u8> for WorkerState {
    fn from(v: u8) -> Self {
        match v {
            0 => WorkerState::Init,
            1 => WorkerState::Running,
            2 => WorkerState::Shifting,
            3 => WorkerState::Blocking,
            _ => WorkerState::Finished,
        }
    }
}

/// 本地调度表
///
/// 整体受工作线程的互斥锁保护；上下文切换期间不持锁
struct Schedule {
    /// 协程表，持有协程句柄
    chroutines_map: HashMap<ChroutineId, Arc<Chroutine>>,
    /// 轮转序列
    chroutines_sched: Vec<Arc<Chroutine>>,
    /// 轮转游标，等于序列长度表示下一轮从头开始
    sched_iter: usize,
    /// 延迟释放表，在每轮调度开始时取出并在锁外释放
    chroutines_to_free: Vec<Arc<Chroutine>>,
}

impl Schedule {
    fn new() -> Self {
        Self {
            chroutines_map: HashMap::new(),
            chroutines_sched: Vec::new(),
            sched_iter: 0,
            chroutines_to_free: Vec::new(),
        }
    }
}

/// 负载估计
///
/// 驱动循环每轮更新一次，供线程池做均衡决策
pub struct LoadTracker {
    /// 驱动循环轮数
    turns: CachePadded<AtomicU64>,
    /// 处理的事件与协程总数
    processed: CachePadded<AtomicU64>,
}

impl LoadTracker {
    fn new() -> Self {
        Self {
            turns: CachePadded::new(AtomicU64::new(0)),
            processed: CachePadded::new(AtomicU64::new(0)),
        }
    }

    /// 记录一轮驱动的处理量
    fn update(&self, processed: usize) {
        self.turns.fetch_add(1, Ordering::Relaxed);
        self.processed.fetch_add(processed as u64, Ordering::Relaxed);
    }

    /// 获取驱动循环轮数
    #[inline]
    pub fn turns(&self) -> u64 {
        self.turns.load(Ordering::Relaxed)
    }

    /// 获取处理总量
    #[inline]
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// 每千轮处理量
    pub fn average_permille(&self) -> u64 {
        let turns = self.turns();
        if turns == 0 {
            return 0;
        }
        self.processed() * 1000 / turns
    }
}

thread_local! {
    /// 本线程正在驱动的工作线程
    static CURRENT_WORKER: RefCell<Option<Weak<WorkerThread>>> = const { RefCell::new(None) };
}

/// 把工作线程登记为本线程的当前驱动者
fn install_current_worker(worker: &Arc<WorkerThread>) {
    CURRENT_WORKER.with(|w| {
        *w.borrow_mut() = Some(Arc::downgrade(worker));
    });
}

/// 访问本线程的当前工作线程
///
/// 先克隆弱引用再调用回调，回调内挂起时不持有线程本地借用
pub fn with_current_worker<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&Arc<WorkerThread>) -> R,
{
    let weak = CURRENT_WORKER.with(|w| w.borrow().clone());
    let worker = weak.and_then(|w| w.upgrade())?;
    Some(f(&worker))
}

/// 当前协程让出 tick 个调度轮
pub fn yield_for(tick: i32) {
    with_current_worker(|w| w.yield_for(tick));
}

/// 当前协程定时等待；到期时终止未完成的子协程
pub fn wait(ms: u64) {
    with_current_worker(|w| w.wait(ms));
}

/// 当前协程定时等待；到期后子协程继续运行
pub fn sleep(ms: u64) {
    with_current_worker(|w| w.sleep(ms));
}

/// 获取当前协程 ID
pub fn current_id() -> ChroutineId {
    with_current_worker(|w| w.running_id()).unwrap_or(INVALID_ID)
}

/// 工作线程
///
/// 通过 `Arc` 共享；`start` 启动驱动循环后，
/// 调度表由本线程独占驱动，其他线程只经由加锁接口访问
pub struct WorkerThread {
    /// 本地调度表
    schedule: Mutex<Schedule>,
    /// 正在运行的协程 ID
    running_id: AtomicU64,
    /// 可轮询对象注册表，以句柄指针为键
    selectors: Mutex<HashMap<usize, Arc<dyn Selectable>>>,
    /// 工作线程状态
    state: AtomicU8,
    /// 停止请求标记
    need_stop: AtomicBool,
    /// 驱动循环是否在运行
    is_running: AtomicBool,
    /// 当前协程的进入时刻，0 表示不在协程内
    entry_time: CachePadded<AtomicU64>,
    /// 负载估计
    load: LoadTracker,
    /// 池分配的创建序号
    creating_index: AtomicUsize,
    /// 所属线程池
    pool: Mutex<Option<Weak<dyn WorkerPool>>>,
    /// OS 线程句柄
    thread: Mutex<Option<JoinHandle<()>>>,
    /// 驱动循环所在的 OS 线程 ID
    os_thread_id: Mutex<Option<ThreadId>>,
}

impl WorkerThread {
    /// 创建新的工作线程，驱动循环尚未启动
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            schedule: Mutex::new(Schedule::new()),
            running_id: AtomicU64::new(INVALID_ID),
            selectors: Mutex::new(HashMap::new()),
            state: AtomicU8::new(WorkerState::Init as u8),
            need_stop: AtomicBool::new(false),
            is_running: AtomicBool::new(false),
            entry_time: CachePadded::new(AtomicU64::new(0)),
            load: LoadTracker::new(),
            creating_index: AtomicUsize::new(0),
            pool: Mutex::new(None),
            thread: Mutex::new(None),
            os_thread_id: Mutex::new(None),
        })
    }

    /// 绑定所属线程池
    pub fn set_pool(&self, pool: &Arc<dyn WorkerPool>) {
        *self.pool.lock() = Some(Arc::downgrade(pool));
    }

    /// 获取工作线程状态
    #[inline]
    pub fn state(&self) -> WorkerState {
        WorkerState::from(self.state.load(Ordering::Acquire))
    }

    /// 设置工作线程状态
    fn set_state(&self, state: WorkerState) {
        trace!(from = ?self.state(), to = ?state, "worker state change");
        self.state.store(state as u8, Ordering::Release);
    }

    /// 检查驱动循环是否在运行
    #[inline]
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    /// 获取当前协程的进入时刻
    #[inline]
    pub fn entry_time(&self) -> u64 {
        self.entry_time.load(Ordering::Relaxed)
    }

    #[inline]
    fn set_entry_time(&self) {
        self.entry_time.store(clock::now_ms(), Ordering::Relaxed);
    }

    #[inline]
    fn clear_entry_time(&self) {
        self.entry_time.store(0, Ordering::Relaxed);
    }

    /// 获取池分配的创建序号
    #[inline]
    pub fn creating_index(&self) -> usize {
        self.creating_index.load(Ordering::Relaxed)
    }

    /// 获取正在运行的协程 ID
    #[inline]
    pub fn running_id(&self) -> ChroutineId {
        self.running_id.load(Ordering::Relaxed)
    }

    /// 获取负载估计
    #[inline]
    pub fn load(&self) -> &LoadTracker {
        &self.load
    }

    /// 获取驱动循环所在的 OS 线程 ID
    pub fn thread_id(&self) -> Option<ThreadId> {
        *self.os_thread_id.lock()
    }

    /// 检查调度表是否已空
    pub fn done(&self) -> bool {
        self.schedule.lock().chroutines_map.is_empty()
    }

    /// 获取协程数量
    pub fn chroutine_count(&self) -> usize {
        self.schedule.lock().chroutines_map.len()
    }

    /// 查找协程
    pub fn chroutine(&self, id: ChroutineId) -> Option<Arc<Chroutine>> {
        self.schedule.lock().chroutines_map.get(&id).cloned()
    }

    /// 启动驱动循环
    pub fn start(self: &Arc<Self>, creating_index: usize) {
        if self.is_running() {
            return;
        }

        self.creating_index.store(creating_index, Ordering::Relaxed);
        let worker = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("chroutine-worker-{}", creating_index))
            .spawn(move || worker.schedule())
            .expect("failed to spawn worker thread");
        *self.thread.lock() = Some(handle);
    }

    /// 请求停止；驱动循环在当轮结束后退出
    pub fn stop(&self) {
        info!(index = self.creating_index(), "worker stop requested");
        self.need_stop.store(true, Ordering::Release);
    }

    /// 等待驱动循环所在线程退出
    pub fn join(&self) {
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }

    /// 驱动循环
    ///
    /// 每轮：轮询所有可轮询对象，恢复至多一个协程，更新负载；
    /// 整轮无事可做时休眠，避免空转
    fn schedule(self: &Arc<Self>) {
        self.update_thread_id();
        install_current_worker(self);
        self.set_state(WorkerState::Running);
        self.is_running.store(true, Ordering::Release);
        info!(index = self.creating_index(), "worker schedule loop started");

        let pool = self.pool.lock().clone();
        if let Some(pool) = pool.and_then(|w| w.upgrade()) {
            pool.on_thread_ready(self.creating_index(), thread::current().id());
        }

        while !self.need_stop.load(Ordering::Acquire) {
            let mut processed = self.select_all();
            processed += self.pick_run_chroutine();
            self.load.update(processed);
            if processed == 0 {
                thread::sleep(Duration::from_millis(IDLE_SLEEP_MS));
            }
        }

        self.is_running.store(false, Ordering::Release);
        self.set_state(WorkerState::Finished);
        self.clear_all_chroutine();
        CURRENT_WORKER.with(|w| *w.borrow_mut() = None);
        info!(index = self.creating_index(), "worker schedule loop exited");
    }

    fn update_thread_id(&self) {
        *self.os_thread_id.lock() = Some(thread::current().id());
    }

    /// 轮询所有注册对象，返回处理的事件总数
    fn select_all(&self) -> usize {
        let selectors: Vec<Arc<dyn Selectable>> = self.selectors.lock().values().cloned().collect();
        selectors.iter().map(|s| s.poll(0)).sum()
    }

    /// 注册可轮询对象
    pub fn register_selector(&self, obj: &Arc<dyn Selectable>) {
        let key = Arc::as_ptr(obj) as *const () as usize;
        self.selectors.lock().entry(key).or_insert_with(|| Arc::clone(obj));
    }

    /// 注销可轮询对象
    pub fn unregister_selector(&self, obj: &Arc<dyn Selectable>) {
        let key = Arc::as_ptr(obj) as *const () as usize;
        if self.selectors.lock().remove(&key).is_none() {
            error!(key, "unregister_selector: key not exist");
        }
    }

    /// 创建新协程，插入轮转序列尾部
    ///
    /// 线程已过 Running 状态时拒绝创建
    pub fn create_chroutine(&self, func: ChroutineFn, arg: ChroutineArg) -> ChroutineId {
        if self.state() > WorkerState::Running {
            error!(state = ?self.state(), "cant create chroutine");
            return INVALID_ID;
        }

        let id = gen_chroutine_id();
        let c = match Chroutine::new(id, func, arg) {
            Ok(c) => Arc::new(c),
            Err(e) => {
                error!(id, error = %e, "chroutine construction failed");
                return INVALID_ID;
            }
        };

        let mut sched = self.schedule.lock();
        sched.chroutines_map.insert(id, Arc::clone(&c));
        sched.chroutines_sched.push(c);
        drop(sched);

        trace!(id, "chroutine created");
        id
    }

    /// 以当前协程为父，创建子协程
    ///
    /// 回报器同时挂到父协程并作为子协程的入口参数传入
    pub fn create_son_chroutine<T: Send + 'static>(
        &self,
        func: ChroutineFn,
        reporter: &Arc<Reporter<T>>,
    ) -> ChroutineId {
        if self.state() > WorkerState::Running {
            error!(state = ?self.state(), "cant create son chroutine");
            return INVALID_ID;
        }

        let father_id = self.running_id();
        let father = match self.chroutine(father_id) {
            Some(f) => f,
            None => return INVALID_ID,
        };

        let reporter_clone: Arc<Reporter<T>> = Arc::clone(reporter);
        father.set_reporter(reporter_clone as Arc<dyn ReporterBase>);

        let data: Arc<dyn Any + Send + Sync> = Arc::clone(reporter) as Arc<dyn Any + Send + Sync>;
        let son = self.create_chroutine(func, Some(data));
        if son == INVALID_ID {
            return INVALID_ID;
        }

        if let Some(s) = self.chroutine(son) {
            s.set_father(father_id);
        }
        father.set_son(son);
        son
    }

    /// 当前协程让出 tick 个调度轮
    pub fn yield_for(&self, tick: i32) {
        self.yield_current(tick);
    }

    /// 当前协程定时等待；到期时终止未完成的子协程
    pub fn wait(&self, ms: u64) {
        self.wait_current(ms, true);
    }

    /// 当前协程定时等待；到期后子协程继续运行
    pub fn sleep(&self, ms: u64) {
        self.wait_current(ms, false);
    }

    /// 让出原语：记录轮数、挂起、切回宿主上下文
    fn yield_current(&self, tick: i32) {
        if tick <= 0 {
            return;
        }

        let running = self.running_id();
        if running == INVALID_ID {
            return;
        }
        let co = match self.chroutine(running) {
            Some(c) => c,
            None => return,
        };
        if co.state() != ChroutineState::Running {
            return;
        }

        co.set_state(ChroutineState::Suspend);
        co.add_yield_wait(tick);
        self.running_id.store(INVALID_ID, Ordering::Relaxed);
        chroutine::suspend_current();
    }

    /// 定时等待原语：记录唤醒时刻、挂起、切回宿主上下文
    fn wait_current(&self, wait_time_ms: u64, stop_son_after_wait: bool) {
        if wait_time_ms == 0 {
            return;
        }

        let running = self.running_id();
        if running == INVALID_ID {
            return;
        }
        let co = match self.chroutine(running) {
            Some(c) => c,
            None => return,
        };
        if co.state() != ChroutineState::Running {
            return;
        }

        co.set_state(ChroutineState::Suspend);
        co.set_yield_to(clock::after_ms(wait_time_ms));
        co.set_stop_son(stop_son_after_wait);
        self.running_id.store(INVALID_ID, Ordering::Relaxed);
        chroutine::suspend_current();
    }

    /// 唤醒定时等待中的协程，等效于其子协程以 Done 结束
    pub fn awake_chroutine(&self, id: ChroutineId) -> i32 {
        let c = match self.chroutine(id) {
            Some(c) => c,
            None => {
                error!(id, "awake_chroutine: unknown id");
                return -1;
            }
        };

        let son = c.yield_over(SonResult::Done);
        if son != INVALID_ID {
            self.remove_chroutine(son);
        }
        0
    }

    /// 直接恢复指定的挂起协程（诊断用）
    pub fn resume_to(&self, id: ChroutineId) {
        let c = match self.chroutine(id) {
            Some(c) => c,
            None => return,
        };
        if c.state() != ChroutineState::Suspend {
            return;
        }

        self.run_chroutine(&c);
    }

    /// 移除协程
    ///
    /// 句柄移入延迟释放表，轮转序列同步删除并修正游标；未知 ID 不报错
    pub fn remove_chroutine(&self, id: ChroutineId) {
        let mut sched = self.schedule.lock();
        let c = match sched.chroutines_map.remove(&id) {
            Some(c) => c,
            None => return,
        };
        sched.chroutines_to_free.push(c);

        if let Some(pos) = sched.chroutines_sched.iter().position(|c| c.id == id) {
            sched.chroutines_sched.remove(pos);
            // 游标在删除点之后时左移一格，保持指向同一元素；
            // 正指向删除点时自然落在后继上
            if sched.sched_iter > pos {
                sched.sched_iter -= 1;
            }
        }
    }

    /// 清空调度表
    ///
    /// 句柄在锁外释放：析构挂起协程会展开其栈，可能运行任意 Drop 代码
    pub fn clear_all_chroutine(&self) {
        let (map, sched_list, to_free) = {
            let mut sched = self.schedule.lock();
            sched.sched_iter = 0;
            (
                mem::take(&mut sched.chroutines_map),
                mem::take(&mut sched.chroutines_sched),
                mem::take(&mut sched.chroutines_to_free),
            )
        };
        drop(map);
        drop(sched_list);
        drop(to_free);
    }

    /// 选出并运行至多一个协程，返回本轮是否有协程运行
    ///
    /// 从游标向后扫描到序列末尾，选中第一个未迁移且 `wait` 归零的协程；
    /// 被跳过的协程也计入一次扫描（让出轮数自减在扫描中发生）。
    /// 整轮无可运行协程时游标落在末尾，下一轮从头开始
    fn pick_run_chroutine(&self) -> usize {
        if self.running_id() != INVALID_ID {
            return 1;
        }

        let now = clock::now_ms();
        let mut chosen: Option<Arc<Chroutine>> = None;
        let to_free;
        {
            let mut sched = self.schedule.lock();
            to_free = mem::take(&mut sched.chroutines_to_free);

            let len = sched.chroutines_sched.len();
            if len == 0 {
                drop(sched);
                drop(to_free);
                return 0;
            }

            if sched.sched_iter >= len {
                sched.sched_iter = 0;
            }

            let mut next_iter = len;
            for i in sched.sched_iter..len {
                let node = &sched.chroutines_sched[i];
                if node.has_moved() || node.wait(now) > 0 {
                    continue;
                }
                if chosen.is_none() {
                    chosen = Some(Arc::clone(node));
                    next_iter = i + 1;
                }
            }
            sched.sched_iter = next_iter;
        }
        // 延迟释放必须在锁外：析构被终止的协程会展开其栈
        drop(to_free);

        match chosen {
            Some(c) => {
                // 定时等待到期：先结算超时、移除超时的子协程，再切入
                let timed_out_son = c.yield_over(SonResult::Timeout);
                if timed_out_son != INVALID_ID {
                    self.remove_chroutine(timed_out_son);
                }
                self.run_chroutine(&c);
                1
            }
            None => 0,
        }
    }

    /// 切入协程并处理其返回
    fn run_chroutine(&self, c: &Arc<Chroutine>) {
        c.set_state(ChroutineState::Running);
        self.running_id.store(c.id, Ordering::Relaxed);
        self.set_entry_time();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| c.resume()));

        self.clear_entry_time();
        chroutine::clear_current_yielder();

        match outcome {
            Ok(CoroutineResult::Yield(())) => {
                // 挂起原语已记录元数据并清除 running_id
            }
            Ok(CoroutineResult::Return(())) => {
                self.finish_chroutine(c, SonResult::Done);
            }
            Err(_) => {
                error!(id = c.id, "chroutine panicked");
                self.finish_chroutine(c, SonResult::Error);
            }
        }
    }

    /// 协程结束：移出调度表并通知父协程
    fn finish_chroutine(&self, c: &Arc<Chroutine>, result: SonResult) {
        c.set_state(ChroutineState::Finished);
        self.remove_chroutine(c.id);
        self.running_id.store(INVALID_ID, Ordering::Relaxed);

        let father_id = c.father();
        if father_id != INVALID_ID {
            if let Some(father) = self.chroutine(father_id) {
                match result {
                    SonResult::Done => father.son_finished(),
                    _ => father.son_faulted(),
                }
            }
        }
    }

    /// 把除正在运行者之外的所有协程迁往另一工作线程
    ///
    /// 迁出前先打迁移标记，本线程的选取路径不会再碰它；
    /// 迁出方与接收方的锁从不同时持有
    pub fn move_chroutines_to_thread(&self, other: &Arc<WorkerThread>) {
        if std::ptr::eq(self, Arc::as_ptr(other)) {
            return;
        }

        self.set_state(WorkerState::Shifting);

        let running = self.running_id();
        let candidates: Vec<Arc<Chroutine>> = {
            let sched = self.schedule.lock();
            sched
                .chroutines_sched
                .iter()
                .filter(|c| c.id != running)
                .cloned()
                .collect()
        };

        let mut ids_to_move = Vec::with_capacity(candidates.len());
        for c in candidates {
            c.set_moved(true);
            let resettled_id = other.resettle(&c);
            if resettled_id == c.id {
                ids_to_move.push(c.id);
            } else {
                c.set_moved(false);
            }
            debug!(id = c.id, resettled_id, "chroutine migrated");
        }

        for id in ids_to_move {
            self.remove_chroutine(id);
        }

        self.set_state(WorkerState::Blocking);
    }

    /// 迁移协议的接收端：接管迁来的协程
    ///
    /// 取走迁出方的执行上下文，装入本线程的调度表，成功返回原 ID
    pub fn resettle(&self, donor: &Chroutine) -> ChroutineId {
        let c = match Chroutine::resettle_from(donor) {
            Some(c) => Arc::new(c),
            None => return INVALID_ID,
        };
        let id = c.id;

        let mut sched = self.schedule.lock();
        sched.chroutines_map.insert(id, Arc::clone(&c));
        sched.chroutines_sched.push(c);
        drop(sched);

        trace!(id, "chroutine resettled");
        id
    }
}
