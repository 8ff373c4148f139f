//! Integration tests for the knarr kernel
//!
//! End-to-end scenarios across the scheduler, syscall dispatcher, signals,
//! sockets, and the fork engine. Each test builds its own kernel context.

use knarr::kernel::signal::SignalSlot;
use knarr::kernel::stack::{frame_chain, WORD};
use knarr::kernel::syscall::SyscallNr;
use knarr::kernel::task::ExitHook;
use knarr::{Kernel, KernelConfig, RunOutcome, SyscallError, TaskId, TaskState, TaskStep, TrapFrame};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Spawn a task that logs each dispatch into `log` and yields forever.
fn spinner(k: &mut Kernel, log: &Rc<RefCell<Vec<TaskId>>>, name: &str) -> TaskId {
    let log = log.clone();
    k.create(
        Rc::new(move |_, id| {
            log.borrow_mut().push(id);
            TaskStep::Yield
        }),
        name,
        None,
    )
    .expect("create")
}

// ============================================================================
// Scheduling
// ============================================================================

#[test]
fn test_round_robin_interleaving() {
    let mut k = Kernel::new();
    let log = Rc::new(RefCell::new(Vec::new()));
    let ids: Vec<TaskId> = (0..3)
        .map(|i| spinner(&mut k, &log, &format!("spin{}", i)))
        .collect();

    assert_eq!(k.run(9), RunOutcome::BudgetExhausted);

    // Nine dispatches, three rounds: every task ran exactly once per round
    // and idle never ran
    let log = log.borrow();
    assert_eq!(log.len(), 9);
    for round in log.chunks(3) {
        let mut sorted: Vec<TaskId> = round.to_vec();
        sorted.sort_by_key(|id| id.0);
        assert_eq!(sorted, ids);
    }
    assert!(!log.contains(&TaskId::IDLE));
}

#[test]
fn test_run_reaches_idle_after_exits() {
    let mut k = Kernel::new();
    for i in 0..4 {
        k.create(
            Rc::new(move |_, _| TaskStep::Exit(i)),
            &format!("worker{}", i),
            None,
        )
        .expect("create");
    }
    assert_eq!(k.run(100), RunOutcome::Idle);

    // Four exit notifications, one per task, delivered exactly once
    let mut statuses = Vec::new();
    while let Ok((_, status)) = k.sys_wait() {
        statuses.push(status);
    }
    statuses.sort();
    assert_eq!(statuses, vec![0, 1, 2, 3]);
}

#[test]
fn test_zombies_reclaimed_and_ids_not_reused() {
    let mut k = Kernel::new();
    let a = k
        .create(Rc::new(|_, _| TaskStep::Exit(0)), "a", None)
        .expect("create");
    assert_eq!(k.run(50), RunOutcome::Idle);

    // Drive reclaim passes until the block is gone
    for _ in 0..4 {
        k.schedule();
    }
    assert!(k.task(a).is_none());

    let b = k
        .create(Rc::new(|_, _| TaskStep::Exit(0)), "b", None)
        .expect("create");
    assert!(b.0 > a.0, "ids increase even after reclaim");
}

#[test]
fn test_create_at_capacity_fails_and_logs() {
    let cfg = KernelConfig::from_json(r#"{"max_tasks": 3}"#).unwrap();
    let mut k = Kernel::with_config(cfg);
    k.create(Rc::new(|_, _| TaskStep::Yield), "one", None)
        .expect("create");
    k.create(Rc::new(|_, _| TaskStep::Yield), "two", None)
        .expect("create");

    let err = k.create(Rc::new(|_, _| TaskStep::Yield), "three", None);
    assert!(err.is_err());
    assert_eq!(k.task_count(), 3); // idle + two
}

// ============================================================================
// Wait / parent-child
// ============================================================================

#[test]
fn test_parent_spawns_and_reaps() {
    let mut k = Kernel::new();
    let reaped = Rc::new(RefCell::new(Vec::new()));

    let reaped2 = reaped.clone();
    let spawned = Rc::new(Cell::new(false));
    let parent = k
        .create(
            Rc::new(move |k, _| {
                if !spawned.get() {
                    spawned.set(true);
                    for status in [11, 22] {
                        k.create(
                            Rc::new(move |_, _| TaskStep::Exit(status)),
                            "child",
                            None,
                        )
                        .expect("spawn child");
                    }
                }
                match k.sys_wait() {
                    Ok(pair) => {
                        reaped2.borrow_mut().push(pair);
                        if reaped2.borrow().len() == 2 {
                            TaskStep::Exit(0)
                        } else {
                            TaskStep::Yield
                        }
                    }
                    Err(_) => TaskStep::Yield,
                }
            }),
            "parent",
            None,
        )
        .expect("create parent");

    assert_eq!(k.run(200), RunOutcome::Idle);

    let reaped = reaped.borrow();
    assert_eq!(reaped.len(), 2);
    let mut statuses: Vec<i32> = reaped.iter().map(|&(_, s)| s).collect();
    statuses.sort();
    assert_eq!(statuses, vec![11, 22]);
    assert!(reaped.iter().all(|&(id, _)| id != parent));
}

#[test]
fn test_exit_hook_runs_before_reaping() {
    let mut k = Kernel::new();
    let order = Rc::new(RefCell::new(Vec::new()));

    let order2 = order.clone();
    let hook: ExitHook = Rc::new(move |_, id, status| {
        order2.borrow_mut().push(format!("hook {} {}", id, status));
    });
    let id = k
        .create(
            Rc::new(move |_, _| TaskStep::Exit(5)),
            "hooked",
            Some(hook),
        )
        .expect("create");

    assert_eq!(k.run(50), RunOutcome::Idle);
    assert_eq!(k.sys_wait(), Ok((id, 5)));
    assert_eq!(*order.borrow(), vec![format!("hook {} 5", id)]);
}

#[test]
fn test_orphaned_children_survive() {
    let mut k = Kernel::new();
    // A parent that forks once and exits immediately, before the child runs
    let forked = Rc::new(Cell::new(false));
    let child_seen = Rc::new(Cell::new(false));

    let forked2 = forked.clone();
    let child_seen2 = child_seen.clone();
    k.create(
        Rc::new(move |k, _| {
            if !forked2.get() {
                forked2.set(true);
                k.fork().expect("fork");
                TaskStep::Exit(0) // parent dies first
            } else {
                child_seen2.set(true); // the orphan still runs
                TaskStep::Exit(0)
            }
        }),
        "orphan-maker",
        None,
    )
    .expect("create");

    assert_eq!(k.run(100), RunOutcome::Idle);
    assert!(child_seen.get());
}

// ============================================================================
// Fork
// ============================================================================

#[test]
fn test_fork_preserves_frame_structure() {
    let mut k = Kernel::new();
    let parent = k
        .create(Rc::new(|_, _| TaskStep::Yield), "deep", None)
        .expect("create");
    k.step();
    assert_eq!(k.current(), parent);

    // Build a three-frame call chain on the parent's stack
    let snapshot = {
        let tcb = k.task_mut(parent).unwrap();
        let mut sp = tcb.cpu.sp;
        let mut bp = 0usize;
        for i in 0..3 {
            sp = tcb.user_stack.push_word(sp, 0x9000 + i).unwrap();
            sp = tcb.user_stack.push_word(sp, bp).unwrap();
            bp = sp;
        }
        let mut snap = tcb.cpu;
        snap.sp = sp;
        snap.bp = bp;
        snap
    };

    let child = k.fork_with(snapshot).expect("fork");

    let parent_frames = {
        let tcb = k.task(parent).unwrap();
        frame_chain(&tcb.user_stack, snapshot.sp, snapshot.bp)
    };
    let (child_frames, delta) = {
        let tcb = k.task(child).unwrap();
        let delta = tcb.user_stack.top() as isize
            - k.task(parent).unwrap().user_stack.top() as isize;
        // One word below the translated sp sits the fork trampoline
        (
            frame_chain(&tcb.user_stack, tcb.cpu.sp + WORD, tcb.cpu.bp),
            delta,
        )
    };

    assert_eq!(parent_frames.len(), 3);
    assert_eq!(child_frames.len(), parent_frames.len());
    for (c, p) in child_frames.iter().zip(parent_frames.iter()) {
        assert_eq!(*c as isize - *p as isize, delta);
    }
}

// ============================================================================
// Signals
// ============================================================================

#[test]
fn test_signal_roundtrip_through_syscalls() {
    let mut k = Kernel::new();
    let hits = Rc::new(RefCell::new(Vec::new()));
    let sink = hits.clone();
    let token = k.register_handler(Rc::new(move |_, id, sig| {
        sink.borrow_mut().push((id, sig));
    }));

    let armed = Rc::new(Cell::new(false));
    let armed2 = armed.clone();
    let victim = k
        .create(
            Rc::new(move |k, _| {
                if !armed2.get() {
                    armed2.set(true);
                    // signal(2, token) binds the handler for this task
                    let mut frame =
                        TrapFrame::new(SyscallNr::Signal.num(), &[2, token.0]);
                    k.dispatch(&mut frame);
                    assert_eq!(frame.ret, 0);
                }
                TaskStep::Yield
            }),
            "victim",
            None,
        )
        .expect("create");

    // Let the victim arm itself
    k.run(3);
    assert!(armed.get());

    // kill(victim, 2); delivery happens at the victim's next delivery point
    k.sys_kill(victim, 2).unwrap();
    k.run(3);
    assert_eq!(*hits.borrow(), vec![(victim, 2)]);

    // No new kill: no further delivery
    k.run(3);
    assert_eq!(hits.borrow().len(), 1);
}

#[test]
fn test_idle_resume_instrumentation_delivers_signals() {
    let mut k = Kernel::new();
    let hits = Rc::new(Cell::new(0));
    let sink = hits.clone();
    let token = k.register_handler(Rc::new(move |_, _, _| sink.set(sink.get() + 1)));
    k.task_mut(TaskId::IDLE)
        .unwrap()
        .signals
        .bind(4, SignalSlot::Handler(token))
        .unwrap();

    // Only idle is runnable: re-selection instruments its kernel stack
    k.task_mut(TaskId::IDLE).unwrap().signals.raise(4).unwrap();
    k.step();
    k.step();
    assert_eq!(hits.get(), 1);
    assert!(k.stats().signal_checks >= 1);
}

#[test]
fn test_fatal_signal_halts_whole_kernel() {
    let mut k = Kernel::new();
    let victim = k
        .create(Rc::new(|_, _| TaskStep::Yield), "victim", None)
        .expect("create");

    k.sys_kill(victim, 0).unwrap(); // divide-error class, pre-bound fatal
    let outcome = k.run(10);
    assert!(matches!(outcome, RunOutcome::Halted(_)));
    assert!(k.halted().unwrap().contains("divide error"));
}

// ============================================================================
// Sockets
// ============================================================================

#[test]
fn test_socket_pair_hello() {
    let mut k = Kernel::new();
    // Raw channel-level scenario: create two endpoints and splice them
    let a = k.sockets_mut().create(1, 1, 0).unwrap();
    let b = k.sockets_mut().create(1, 1, 0).unwrap();
    k.sockets_mut().connect(a, b).unwrap();

    assert_eq!(k.sockets_mut().send(a, b"hello").unwrap(), 5);
    let mut buf = [0u8; 5];
    assert_eq!(k.sockets_mut().recv(b, &mut buf).unwrap(), 5);
    assert_eq!(&buf, b"hello");

    // Three bytes queued, ten requested: recv reports three
    k.sockets_mut().send(a, b"abc").unwrap();
    let mut buf = [0u8; 10];
    assert_eq!(k.sockets_mut().recv(b, &mut buf).unwrap(), 3);
}

#[test]
fn test_tasks_talk_over_named_socket() {
    let mut k = Kernel::new();
    let heard = Rc::new(RefCell::new(Vec::new()));

    // Server: bind a socket under a name, then drain it
    let heard2 = heard.clone();
    let server_state = Rc::new(RefCell::new(None));
    let server_state2 = server_state.clone();
    k.create(
        Rc::new(move |k, _| {
            let mut state = server_state2.borrow_mut();
            let fd = match *state {
                Some(fd) => fd,
                None => {
                    let fd = k.sys_socket(1, 1, 0).expect("socket");
                    k.sys_bind(fd, "svc.chat").expect("bind");
                    *state = Some(fd);
                    fd
                }
            };
            let mut buf = [0u8; 16];
            match k.sys_recv(fd, &mut buf) {
                Ok(0) | Err(_) => TaskStep::Yield,
                Ok(n) => {
                    heard2.borrow_mut().extend_from_slice(&buf[..n]);
                    TaskStep::Exit(0)
                }
            }
        }),
        "server",
        None,
    )
    .expect("create server");

    // Client: connect by name and say hello
    let sent = Rc::new(Cell::new(false));
    let sent2 = sent.clone();
    k.create(
        Rc::new(move |k, _| {
            if sent2.get() {
                return TaskStep::Exit(0);
            }
            let fd = match k.sys_socket(1, 1, 0) {
                Ok(fd) => fd,
                Err(_) => return TaskStep::Yield,
            };
            match k.sys_connect(fd, "svc.chat") {
                Ok(()) => {
                    k.sys_send(fd, b"hi server").expect("send");
                    sent2.set(true);
                    TaskStep::Yield
                }
                Err(_) => {
                    // Server not bound yet; clean up and retry next round
                    let _ = k.sys_close(fd);
                    TaskStep::Yield
                }
            }
        }),
        "client",
        None,
    )
    .expect("create client");

    assert_eq!(k.run(100), RunOutcome::Idle);
    assert_eq!(heard.borrow().as_slice(), b"hi server");
}

#[test]
fn test_send_on_unconnected_socket_reports() {
    let mut k = Kernel::new();
    let fd = k.sys_socket(1, 1, 0).unwrap();
    assert!(matches!(
        k.sys_send(fd, b"void"),
        Err(SyscallError::Socket(_))
    ));
    assert!(k.halted().is_none());
}

// ============================================================================
// Rendezvous channel
// ============================================================================

#[test]
fn test_rendezvous_receiver_spins_until_send() {
    let mut k = Kernel::new();
    let got = Rc::new(RefCell::new(None));
    let spins = Rc::new(Cell::new(0u32));

    let got2 = got.clone();
    let spins2 = spins.clone();
    let bound = Rc::new(Cell::new(false));
    let receiver = k
        .create(
            Rc::new(move |k, _| {
                if !bound.get() {
                    bound.set(true);
                    k.ipc_bind().expect("bind");
                }
                match k.ipc_recv() {
                    Ok(data) => {
                        *got2.borrow_mut() = Some(data);
                        TaskStep::Exit(0)
                    }
                    Err(_) => {
                        spins2.set(spins2.get() + 1);
                        TaskStep::Yield
                    }
                }
            }),
            "receiver",
            None,
        )
        .expect("create receiver");

    // Let the receiver spin a few rounds first
    k.run(4);
    assert!(spins.get() > 0);
    assert!(got.borrow().is_none());

    let sent = Rc::new(Cell::new(false));
    let sent2 = sent.clone();
    k.create(
        Rc::new(move |k, _| {
            if !sent2.get() {
                sent2.set(true);
                k.ipc_send(receiver, b"wake up").expect("send");
            }
            TaskStep::Exit(0)
        }),
        "sender",
        None,
    )
    .expect("create sender");

    assert_eq!(k.run(100), RunOutcome::Idle);
    assert_eq!(got.borrow().as_deref(), Some(b"wake up".as_slice()));
    assert_eq!(k.task(receiver).unwrap().state, TaskState::Zombie);
}

// ============================================================================
// Dispatcher
// ============================================================================

#[test]
fn test_out_of_range_syscall_keeps_running() {
    let mut k = Kernel::new();
    let log = Rc::new(RefCell::new(Vec::new()));
    spinner(&mut k, &log, "bystander");

    let mut frame = TrapFrame::new(4096, &[1, 2, 3]);
    k.dispatch(&mut frame);
    assert!(frame.ret < 0);

    // The kernel keeps scheduling normally afterwards
    assert_eq!(k.run(3), RunOutcome::BudgetExhausted);
    assert_eq!(log.borrow().len(), 3);
}

#[test]
fn test_sleep_tick_wakeup_end_to_end() {
    let mut k = Kernel::new();
    let finished = Rc::new(Cell::new(false));

    let finished2 = finished.clone();
    k.create(
        Rc::new(move |k, _| {
            let mut frame = TrapFrame::new(SyscallNr::Sleep.num(), &[2]);
            k.dispatch(&mut frame);
            if frame.ret == 0 {
                finished2.set(true);
                TaskStep::Exit(0)
            } else {
                TaskStep::Yield
            }
        }),
        "sleeper",
        None,
    )
    .expect("create");

    // Without ticks the sleeper just spins
    k.run(5);
    assert!(!finished.get());

    k.tick();
    k.tick();
    assert_eq!(k.run(10), RunOutcome::Idle);
    assert!(finished.get());
}
