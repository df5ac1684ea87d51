// Preemptive task layer: a fixed-capacity table of kernel tasks switched
// round-robin by the timer tick. The tick copies register state between
// the live interrupt frame and the task contexts, so the trampoline's
// ordinary restore path performs the actual switch.

use crate::arch;
use crate::interrupts::InterruptFrame;
use crate::{gdt, serial_println};
use alloc::alloc::{alloc, dealloc, Layout};
use spin::Mutex;

pub const MAX_TASKS: usize = 256;
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

/// RFLAGS for a fresh task: interrupts enabled plus the always-one bit.
const INITIAL_RFLAGS: u64 = 0x202;

pub type TaskId = u64;

/// Entry signature for spawned tasks; the argument arrives in rdi.
pub type TaskEntry = extern "C" fn(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    Blocked,
    Dead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskError {
    TableFull,
    OutOfMemory,
}

#[derive(Clone, Copy)]
struct Task {
    id: TaskId,
    state: TaskState,
    context: InterruptFrame,
    /// Heap address of the kernel stack; 0 for the bootstrap task, whose
    /// stack belongs to the boot path.
    stack_base: usize,
    #[allow(dead_code)]
    priority: u8,
}

/// The fixed task table plus round-robin bookkeeping. Pure in-memory
/// state: the kernel wraps one instance in a spinlock, tests drive their
/// own instances directly.
pub struct Scheduler {
    tasks: [Option<Task>; MAX_TASKS],
    current: usize,
    next_id: TaskId,
    started: bool,
}

impl Scheduler {
    pub const fn new() -> Self {
        const EMPTY: Option<Task> = None;
        Scheduler {
            tasks: [EMPTY; MAX_TASKS],
            current: 0,
            next_id: 1,
            started: false,
        }
    }

    /// Adopt the boot flow as task 0 (the idle task). Its context is
    /// captured by the first tick that switches away from it.
    pub fn bootstrap(&mut self) -> TaskId {
        let id = self.next_id;
        self.next_id += 1;
        self.tasks[0] = Some(Task {
            id,
            state: TaskState::Running,
            context: InterruptFrame::zeroed(),
            stack_base: 0,
            priority: 0,
        });
        self.current = 0;
        self.started = true;
        id
    }

    /// Queue a new task. `stack_top` must already contain the exit
    /// trampoline's return address; `entry_rip` starts executing with
    /// `arg` in rdi on the next free tick.
    pub fn spawn_with(
        &mut self,
        entry_rip: u64,
        arg: usize,
        stack_top: u64,
        stack_base: usize,
        priority: u8,
    ) -> Result<TaskId, TaskError> {
        let slot = self
            .tasks
            .iter()
            .position(|t| t.is_none())
            .ok_or(TaskError::TableFull)?;
        let id = self.next_id;
        self.next_id += 1;

        let mut context = InterruptFrame::zeroed();
        context.rip = entry_rip;
        context.rdi = arg as u64;
        context.rsp = stack_top;
        context.cs = gdt::KERNEL_CODE_SELECTOR as u64;
        context.ss = gdt::KERNEL_DATA_SELECTOR as u64;
        context.rflags = INITIAL_RFLAGS;

        self.tasks[slot] = Some(Task {
            id,
            state: TaskState::Ready,
            context,
            stack_base,
            priority,
        });
        Ok(id)
    }

    /// The preemption point: save the interrupted context, pick the next
    /// ready task round-robin, and load its context over the live frame.
    pub fn tick(&mut self, frame: &mut InterruptFrame) {
        if !self.started {
            return;
        }

        if let Some(task) = self.tasks[self.current].as_mut() {
            task.context = *frame;
            if task.state == TaskState::Running {
                task.state = TaskState::Ready;
            }
        }

        let Some(next) = self.pick_next() else {
            // Nothing else runnable; keep going where we were.
            if let Some(task) = self.tasks[self.current].as_mut() {
                if task.state == TaskState::Ready {
                    task.state = TaskState::Running;
                }
            }
            return;
        };

        self.current = next;
        let task = self.tasks[next].as_mut().unwrap();
        task.state = TaskState::Running;
        *frame = task.context;
    }

    /// Next ready slot after `current`, wrapping once around the table.
    fn pick_next(&self) -> Option<usize> {
        let len = self.tasks.len();
        (1..=len)
            .map(|offset| (self.current + offset) % len)
            .find(|&slot| {
                matches!(
                    self.tasks[slot],
                    Some(Task {
                        state: TaskState::Ready,
                        ..
                    })
                )
            })
    }

    /// Flag the running task dead. Its slot and stack survive until
    /// `drain_dead` collects them from task context.
    pub fn exit_current(&mut self) {
        if let Some(task) = self.tasks[self.current].as_mut() {
            task.state = TaskState::Dead;
        }
    }

    /// Remove dead, non-running slots and collect their stack bases so
    /// the caller can release them outside the scheduler lock.
    pub fn drain_dead(&mut self, stacks: &mut [usize]) -> usize {
        let mut collected = 0;
        for slot in 0..self.tasks.len() {
            if slot == self.current {
                continue;
            }
            let Some(task) = self.tasks[slot] else {
                continue;
            };
            if task.state != TaskState::Dead || collected >= stacks.len() {
                continue;
            }
            stacks[collected] = task.stack_base;
            collected += 1;
            self.tasks[slot] = None;
        }
        collected
    }

    pub fn current_task_id(&self) -> Option<TaskId> {
        self.tasks[self.current].map(|t| t.id)
    }

    pub fn task_state(&self, id: TaskId) -> Option<TaskState> {
        self.tasks
            .iter()
            .flatten()
            .find(|t| t.id == id)
            .map(|t| t.state)
    }

    pub fn task_count(&self) -> usize {
        self.tasks.iter().flatten().count()
    }
}

/// Kernel scheduler instance. Task-context users take the lock with
/// interrupts disabled; the tick path is the only IRQ-context user and
/// skips the tick rather than spin on a held lock.
static SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler::new());

/// Planted at the top of every spawned stack: a task that returns from
/// its entry function lands here.
extern "C" fn task_exit_trampoline() {
    exit();
}

/// Adopt the boot flow as the idle task.
pub fn init() {
    arch::without_interrupts(|| {
        SCHEDULER.lock().bootstrap();
    });
}

/// Create a task with a fresh 16-KiB kernel stack.
pub fn spawn(entry: TaskEntry, arg: usize, priority: u8) -> Result<TaskId, TaskError> {
    let layout = Layout::from_size_align(KERNEL_STACK_SIZE, 16).unwrap();
    // SAFETY: layout is non-zero; ownership of the stack transfers to the
    // task table until reap() releases it.
    let stack_base = unsafe { alloc(layout) };
    if stack_base.is_null() {
        return Err(TaskError::OutOfMemory);
    }

    // Plant the exit trampoline as the return address at the stack top.
    let stack_top = stack_base as usize + KERNEL_STACK_SIZE - 8;
    // SAFETY: stack_top is inside the allocation made above.
    unsafe {
        core::ptr::write(stack_top as *mut u64, task_exit_trampoline as u64);
    }

    let result = arch::without_interrupts(|| {
        SCHEDULER.lock().spawn_with(
            entry as u64,
            arg,
            stack_top as u64,
            stack_base as usize,
            priority,
        )
    });

    if result.is_err() {
        // SAFETY: the table rejected the task, so the stack is ours again.
        unsafe { dealloc(stack_base, layout) };
    }
    result
}

/// Timer-tick hook, IRQ context. A contended lock means a task-side
/// operation is mid-flight with interrupts off somewhere unexpected;
/// skipping one tick is harmless, deadlocking is not.
pub fn scheduler_tick(frame: &mut InterruptFrame) {
    if let Some(mut scheduler) = SCHEDULER.try_lock() {
        scheduler.tick(frame);
    }
}

/// Terminate the calling task. The slot is flagged dead; the next tick
/// deschedules us and `reap` frees the stack later, from task context.
pub fn exit() -> ! {
    arch::without_interrupts(|| {
        SCHEDULER.lock().exit_current();
    });
    loop {
        arch::hlt();
    }
}

/// Release the stacks of dead tasks. Task context only: the heap free
/// list must never be touched from an IRQ.
pub fn reap() {
    let mut stacks = [0usize; 16];
    let count = arch::without_interrupts(|| SCHEDULER.lock().drain_dead(&mut stacks));
    let layout = Layout::from_size_align(KERNEL_STACK_SIZE, 16).unwrap();
    for &stack_base in stacks.iter().take(count) {
        if stack_base != 0 {
            // SAFETY: the base came from the matching alloc in spawn and
            // the owning slot was just cleared.
            unsafe { dealloc(stack_base as *mut u8, layout) };
        }
    }
}

pub fn current_task_id() -> Option<TaskId> {
    arch::without_interrupts(|| SCHEDULER.lock().current_task_id())
}

pub fn task_count() -> usize {
    arch::without_interrupts(|| SCHEDULER.lock().task_count())
}

/// Boot-time diagnostic.
pub fn log_tasks() {
    arch::without_interrupts(|| {
        let scheduler = SCHEDULER.lock();
        serial_println!("scheduler: {} task(s) resident", scheduler.task_count());
    });
}
