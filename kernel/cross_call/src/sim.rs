//! A simulated multiprocessor for running cross-calls on the host.
//!
//! Each simulated CPU is a thread. Raising a level sets a bit in the target's
//! pending mask; a CPU takes pending traps (highest first, and only those above
//! its current level) whenever it calls [`CrossCallPlatform::relax()`],
//! which it does in its idle loop and in every spin-wait. Nested traps thus
//! run on the same thread, just as on hardware.

use std::boxed::Box;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread::{self, JoinHandle, Thread};
use std::time::{Duration, Instant};
use std::vec::Vec;

use cpu::{ActiveCpus, CpuId, CpuSet};
use priority_level::{PriorityLevel, LOCAL_MASK_THRESHOLD};

use crate::{ContextVersion, CrossCallConfig, CrossCallPlatform, CrossCalls, Fatal};

std::thread_local! {
    static CURRENT_CPU: Cell<Option<CpuId>> = Cell::new(None);
}

type Job = Box<dyn FnOnce() + Send>;
type SignalHook = Arc<dyn Fn() + Send + Sync>;

pub(crate) struct SimShared {
    active: ActiveCpus,
    raised: Vec<AtomicU32>,
    irqs_disabled: Vec<AtomicBool>,
    woken: Vec<AtomicBool>,
    parked: Vec<AtomicBool>,
    wakeups: Vec<Mutex<Vec<CpuId>>>,
    invalidations: Vec<Mutex<Vec<(ContextVersion, ContextVersion)>>>,
    device_irqs: Vec<Mutex<Vec<usize>>>,
    on_signal: Vec<Mutex<Option<SignalHook>>>,
    threads: Mutex<Vec<Option<Thread>>>,
    fatal: Mutex<Option<Fatal>>,
    xcalls: OnceLock<Weak<CrossCalls<SimPlatform>>>,
    start: Instant,
    stop: AtomicBool,
}

impl SimShared {
    fn unpark(&self, cpu: CpuId) {
        if let Some(Some(thread)) = self.threads.lock().unwrap().get(cpu.index()) {
            thread.unpark();
        }
    }

    /// Takes every raised trap that the current CPU may take right now.
    fn deliver_pending(&self) {
        let Some(cpu) = CURRENT_CPU.with(|c| c.get()) else { return };
        let Some(xcalls) = self.xcalls.get().and_then(Weak::upgrade) else { return };
        let i = cpu.index();
        loop {
            let mut floor = xcalls.current_level(cpu).value() + 1;
            if self.irqs_disabled[i].load(Ordering::SeqCst) {
                floor = floor.max(LOCAL_MASK_THRESHOLD.value());
            }
            let eligible = self.raised[i].load(Ordering::SeqCst) & !((1u32 << floor) - 1);
            if eligible == 0 {
                return;
            }
            let level = (31 - eligible.leading_zeros()) as u8;
            self.raised[i].fetch_and(!(1u32 << level), Ordering::SeqCst);
            xcalls.handle_trap(PriorityLevel::new(level).unwrap());
        }
    }
}

#[derive(Clone)]
pub(crate) struct SimPlatform(Arc<SimShared>);

impl SimPlatform {
    fn me(&self) -> usize {
        self.current_cpu().index()
    }

    /// Blocks the current CPU until it receives a signal, still taking traps meanwhile.
    pub fn park_current(&self) {
        let i = self.me();
        self.0.parked[i].store(true, Ordering::SeqCst);
        while !self.0.woken[i].swap(false, Ordering::SeqCst) {
            self.relax();
            thread::park_timeout(Duration::from_millis(1));
        }
        self.0.parked[i].store(false, Ordering::SeqCst);
    }

    /// Masks the ordinary (device) levels on the current CPU.
    pub fn disable_local_irqs(&self) {
        self.0.irqs_disabled[self.me()].store(true, Ordering::SeqCst);
    }

    pub fn enable_local_irqs(&self) {
        self.0.irqs_disabled[self.me()].store(false, Ordering::SeqCst);
    }
}

impl CrossCallPlatform for SimPlatform {
    fn current_cpu(&self) -> CpuId {
        CURRENT_CPU.with(|c| c.get()).expect("not running on a simulated CPU")
    }

    fn active_cpus(&self) -> &ActiveCpus {
        &self.0.active
    }

    fn raise(&self, target: CpuId, level: PriorityLevel) {
        self.0.raised[target.index()].fetch_or(1u32 << level.value(), Ordering::SeqCst);
        self.0.unpark(target);
    }

    fn set_local_level(&self, _level: PriorityLevel) {
        // delivery already reads the level from `CrossCalls::current_level()`
    }

    fn relax(&self) {
        self.0.deliver_pending();
        thread::yield_now();
    }

    fn now(&self) -> Duration {
        self.0.start.elapsed()
    }

    fn wake_local(&self, from: CpuId) {
        let i = self.me();
        self.0.wakeups[i].lock().unwrap().push(from);
        self.0.woken[i].store(true, Ordering::SeqCst);
        let hook = self.0.on_signal[i].lock().unwrap().clone();
        if let Some(hook) = hook {
            hook();
        }
    }

    fn invalidate_local_context(&self, old: ContextVersion, new: ContextVersion) {
        self.0.invalidations[self.me()].lock().unwrap().push((old, new));
    }

    fn device_irq(&self, token: usize) {
        self.0.device_irqs[self.me()].lock().unwrap().push(token);
    }

    fn halt(&self, fatal: &Fatal) -> ! {
        *self.0.fatal.lock().unwrap() = Some(*fatal);
        panic!("system halted: {}", fatal);
    }
}

pub(crate) struct SimBuilder {
    cpu_count: usize,
    config: CrossCallConfig,
    stalled: CpuSet,
}

impl SimBuilder {
    pub fn config(mut self, config: CrossCallConfig) -> Self {
        self.config = config;
        self
    }

    /// Makes `cpu` active but never run, so it never takes any trap.
    pub fn stalled(mut self, cpu: CpuId) -> Self {
        self.stalled.insert(cpu);
        self
    }

    pub fn build(self) -> SimMachine {
        let n = self.cpu_count;
        let shared = Arc::new(SimShared {
            active: ActiveCpus::with_cpus(CpuSet::first_n(n)),
            raised: (0..n).map(|_| AtomicU32::new(0)).collect(),
            irqs_disabled: (0..n).map(|_| AtomicBool::new(false)).collect(),
            woken: (0..n).map(|_| AtomicBool::new(false)).collect(),
            parked: (0..n).map(|_| AtomicBool::new(false)).collect(),
            wakeups: (0..n).map(|_| Mutex::new(Vec::new())).collect(),
            invalidations: (0..n).map(|_| Mutex::new(Vec::new())).collect(),
            device_irqs: (0..n).map(|_| Mutex::new(Vec::new())).collect(),
            on_signal: (0..n).map(|_| Mutex::new(None)).collect(),
            threads: Mutex::new((0..n).map(|_| None).collect()),
            fatal: Mutex::new(None),
            xcalls: OnceLock::new(),
            start: Instant::now(),
            stop: AtomicBool::new(false),
        });
        let xcalls = Arc::new(
            CrossCalls::new(SimPlatform(shared.clone()), n, self.config).unwrap()
        );
        shared.xcalls.set(Arc::downgrade(&xcalls)).ok().unwrap();

        let mut jobs = Vec::with_capacity(n);
        let mut handles = Vec::with_capacity(n);
        for id in 0..n as u32 {
            let cpu = CpuId::new(id);
            if self.stalled.contains(cpu) {
                jobs.push(None);
                continue;
            }
            let (tx, rx) = mpsc::channel::<Job>();
            let thread_shared = shared.clone();
            let handle = thread::Builder::new()
                .name(std::format!("sim-cpu-{}", id))
                .spawn(move || cpu_main(thread_shared, cpu, rx))
                .unwrap();
            shared.threads.lock().unwrap()[cpu.index()] = Some(handle.thread().clone());
            jobs.push(Some(tx));
            handles.push(handle);
        }

        SimMachine { xcalls, shared, jobs, handles }
    }
}

fn cpu_main(shared: Arc<SimShared>, cpu: CpuId, jobs: Receiver<Job>) {
    CURRENT_CPU.with(|c| c.set(Some(cpu)));
    let platform = SimPlatform(shared.clone());
    while !shared.stop.load(Ordering::SeqCst) {
        platform.relax();
        match jobs.try_recv() {
            Ok(job) => job(),
            Err(TryRecvError::Empty) => thread::park_timeout(Duration::from_millis(1)),
            Err(TryRecvError::Disconnected) => break,
        }
    }
}

pub(crate) struct JobHandle<R> {
    result: Receiver<thread::Result<R>>,
}

impl<R> JobHandle<R> {
    /// Waits for the job to finish; `Err` if it panicked (e.g., the system halted).
    pub fn join(self) -> thread::Result<R> {
        self.result
            .recv_timeout(Duration::from_secs(30))
            .expect("simulated CPU job did not finish in time")
    }

    /// Returns the job's result if it has already finished.
    pub fn try_join(&self) -> Option<thread::Result<R>> {
        self.result.try_recv().ok()
    }
}

pub(crate) struct SimMachine {
    xcalls: Arc<CrossCalls<SimPlatform>>,
    shared: Arc<SimShared>,
    jobs: Vec<Option<Sender<Job>>>,
    handles: Vec<JoinHandle<()>>,
}

impl SimMachine {
    pub fn new(cpu_count: usize) -> SimMachine {
        SimMachine::builder(cpu_count).build()
    }

    pub fn builder(cpu_count: usize) -> SimBuilder {
        SimBuilder {
            cpu_count,
            config: CrossCallConfig::new().with_ack_timeout(Duration::from_secs(10)),
            stalled: CpuSet::new(),
        }
    }

    pub fn xcalls(&self) -> Arc<CrossCalls<SimPlatform>> {
        self.xcalls.clone()
    }

    /// Runs `f` in thread context on `cpu`.
    pub fn run_on<R, F>(&self, cpu: CpuId, f: F) -> JobHandle<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let job: Job = Box::new(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(f));
            let _ = tx.send(result);
        });
        self.jobs[cpu.index()]
            .as_ref()
            .expect("a stalled CPU cannot run jobs")
            .send(job)
            .unwrap();
        self.shared.unpark(cpu);
        JobHandle { result: rx }
    }

    pub fn offline(&self, cpu: CpuId) {
        self.shared.active.offline(cpu).unwrap();
    }

    pub fn fatal(&self) -> Option<Fatal> {
        *self.shared.fatal.lock().unwrap()
    }

    pub fn is_parked(&self, cpu: CpuId) -> bool {
        self.shared.parked[cpu.index()].load(Ordering::SeqCst)
    }

    pub fn wakeups(&self, cpu: CpuId) -> Vec<CpuId> {
        self.shared.wakeups[cpu.index()].lock().unwrap().clone()
    }

    pub fn invalidations(&self, cpu: CpuId) -> Vec<(ContextVersion, ContextVersion)> {
        self.shared.invalidations[cpu.index()].lock().unwrap().clone()
    }

    pub fn device_irqs(&self, cpu: CpuId) -> Vec<usize> {
        self.shared.device_irqs[cpu.index()].lock().unwrap().clone()
    }

    /// Runs `hook` on `cpu` every time it receives a signal, in trap context.
    pub fn on_signal(&self, cpu: CpuId, hook: impl Fn() + Send + Sync + 'static) {
        *self.shared.on_signal[cpu.index()].lock().unwrap() = Some(Arc::new(hook));
    }
}

impl Drop for SimMachine {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        for hook in &self.shared.on_signal {
            hook.lock().unwrap().take();
        }
        self.jobs.clear();
        for id in 0..self.shared.raised.len() as u32 {
            self.shared.unpark(CpuId::new(id));
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}
