//! Scheduler tests: round-robin rotation, context save/restore through
//! the interrupt frame, task exit and reaping.

use boxos::gdt::{KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR};
use boxos::interrupts::InterruptFrame;
use boxos::task::{Scheduler, TaskError, TaskState, MAX_TASKS};

fn boot_frame() -> InterruptFrame {
    let mut frame = InterruptFrame::zeroed();
    frame.rip = 0xFFFF_8000_0000_1000;
    frame.rsp = 0xFFFF_8000_0010_0000;
    frame.rflags = 0x202;
    frame
}

#[test]
fn tick_before_bootstrap_is_inert() {
    let mut scheduler = Scheduler::new();
    let mut frame = boot_frame();
    let original = frame;
    scheduler.tick(&mut frame);
    assert_eq!(frame, original);
}

#[test]
fn spawned_task_context_is_loaded_on_tick() {
    let mut scheduler = Scheduler::new();
    scheduler.bootstrap();
    let id = scheduler
        .spawn_with(0x1111_2222, 42, 0x9000_0000, 0x8000_0000, 1)
        .unwrap();

    let mut frame = boot_frame();
    scheduler.tick(&mut frame);

    // The frame now carries the new task's context...
    assert_eq!(frame.rip, 0x1111_2222);
    assert_eq!(frame.rdi, 42);
    assert_eq!(frame.rsp, 0x9000_0000);
    assert_eq!(frame.cs, KERNEL_CODE_SELECTOR as u64);
    assert_eq!(frame.ss, KERNEL_DATA_SELECTOR as u64);
    assert_eq!(frame.rflags & 0x200, 0x200, "interrupts enabled");

    // ...and the task is the running one.
    assert_eq!(scheduler.current_task_id(), Some(id));
    assert_eq!(scheduler.task_state(id), Some(TaskState::Running));
}

#[test]
fn round_robin_rotates_through_ready_tasks() {
    let mut scheduler = Scheduler::new();
    let boot_id = scheduler.bootstrap();
    let first = scheduler
        .spawn_with(0x1000, 0, 0xA000, 0, 1)
        .unwrap();
    let second = scheduler
        .spawn_with(0x2000, 0, 0xB000, 0, 1)
        .unwrap();

    let mut frame = boot_frame();
    scheduler.tick(&mut frame);
    assert_eq!(scheduler.current_task_id(), Some(first));
    scheduler.tick(&mut frame);
    assert_eq!(scheduler.current_task_id(), Some(second));
    scheduler.tick(&mut frame);
    assert_eq!(scheduler.current_task_id(), Some(boot_id));
    scheduler.tick(&mut frame);
    assert_eq!(scheduler.current_task_id(), Some(first));
}

#[test]
fn interrupted_context_survives_a_full_rotation() {
    let mut scheduler = Scheduler::new();
    scheduler.bootstrap();
    scheduler.spawn_with(0x1000, 7, 0xA000, 0, 1).unwrap();

    let mut frame = boot_frame();
    frame.rax = 0xDEAD_0001;
    frame.rbx = 0xDEAD_0002;
    frame.r15 = 0xDEAD_0003;
    let saved = frame;

    // Switch away from the boot task, then back to it.
    scheduler.tick(&mut frame);
    assert_ne!(frame, saved);
    scheduler.tick(&mut frame);
    assert_eq!(frame, saved, "boot context must be restored verbatim");
}

#[test]
fn lone_task_keeps_running() {
    let mut scheduler = Scheduler::new();
    let boot_id = scheduler.bootstrap();
    let mut frame = boot_frame();
    let before = frame;
    scheduler.tick(&mut frame);
    assert_eq!(scheduler.current_task_id(), Some(boot_id));
    assert_eq!(frame, before);
    assert_eq!(scheduler.task_state(boot_id), Some(TaskState::Running));
}

#[test]
fn dead_tasks_are_skipped_and_reaped() {
    let mut scheduler = Scheduler::new();
    let boot_id = scheduler.bootstrap();
    let worker = scheduler
        .spawn_with(0x1000, 0, 0xA000, 0xBEEF_0000, 1)
        .unwrap();

    let mut frame = boot_frame();
    scheduler.tick(&mut frame); // now running `worker`
    assert_eq!(scheduler.current_task_id(), Some(worker));

    scheduler.exit_current();
    assert_eq!(scheduler.task_state(worker), Some(TaskState::Dead));

    // The next tick must not pick the dead task again.
    scheduler.tick(&mut frame);
    assert_eq!(scheduler.current_task_id(), Some(boot_id));

    // Reaping hands back the dead task's stack exactly once.
    let mut stacks = [0usize; 4];
    assert_eq!(scheduler.drain_dead(&mut stacks), 1);
    assert_eq!(stacks[0], 0xBEEF_0000);
    assert_eq!(scheduler.task_count(), 1);
    assert_eq!(scheduler.drain_dead(&mut stacks), 0);
    assert_eq!(scheduler.task_state(worker), None);
}

#[test]
fn table_capacity_is_enforced() {
    let mut scheduler = Scheduler::new();
    scheduler.bootstrap();
    for i in 0..MAX_TASKS - 1 {
        scheduler
            .spawn_with(0x1000 + i as u64, 0, 0xA000, 0, 1)
            .unwrap();
    }
    assert_eq!(
        scheduler.spawn_with(0xFFFF, 0, 0xA000, 0, 1),
        Err(TaskError::TableFull)
    );
}
