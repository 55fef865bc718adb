use super::*;
use crate::code::raw_to_float;
use crate::object::TypeInfo;
use std::sync::Mutex;

fn capture_chout(vm: &mut Vm) -> Arc<Mutex<String>> {
    let out = Arc::new(Mutex::new(String::new()));
    let sink = out.clone();
    let chout = vm.chout();
    vm.store
        .console_mut(chout)
        .set_output_callback(Some(Box::new(move |s: &str| {
            sink.lock().unwrap().push_str(s)
        })));
    out
}

fn quiet_cherr(vm: &mut Vm) -> Arc<Mutex<String>> {
    let out = Arc::new(Mutex::new(String::new()));
    let sink = out.clone();
    let cherr = vm.cherr();
    vm.store
        .console_mut(cherr)
        .set_output_callback(Some(Box::new(move |s: &str| {
            sink.lock().unwrap().push_str(s)
        })));
    out
}

fn no_halt() -> VmConfig {
    VmConfig {
        halt_on_empty: false,
        ..Default::default()
    }
}

fn run_frames(vm: &mut Vm, frames: usize) -> bool {
    let in_ch = vm.config().adc_channels as usize;
    let out_ch = vm.config().dac_channels as usize;
    let input = vec![0.0f64; frames * in_ch];
    let mut output = vec![0.0f64; frames * out_ch];
    vm.run(frames, &input, &mut output)
}

#[test]
fn two_shreds_deterministic_ordering() {
    let (mut vm, mut ctl) = Vm::new(no_halt());
    let out = capture_chout(&mut vm);
    vm.start();

    assert!(ctl.queue_msg(Msg::Add {
        code: VmCode::shared("A", vec![Op::Print("A".into()), Op::Exit]),
        args: vec![],
    }));
    assert!(ctl.queue_msg(Msg::Add {
        code: VmCode::shared("B", vec![Op::Print("B".into()), Op::Exit]),
        args: vec![],
    }));
    assert!(run_frames(&mut vm, 1));

    match (ctl.try_reply(), ctl.try_reply()) {
        (Some(Reply::Added(a)), Some(Reply::Added(b))) => {
            assert_eq!(a, ShredId(1));
            assert_eq!(b, ShredId(2));
        }
        other => panic!("unexpected replies: {other:?}"),
    }
    assert_eq!(*out.lock().unwrap(), "A\nB\n");
}

#[test]
fn yield_lets_other_due_shreds_run_first() {
    let (mut vm, _ctl) = Vm::new(no_halt());
    let out = capture_chout(&mut vm);
    vm.spork(
        VmCode::shared("A", vec![Op::Yield, Op::Print("A2".into()), Op::Exit]),
        None,
        false,
    );
    vm.spork(
        VmCode::shared("B", vec![Op::Print("B1".into()), Op::Exit]),
        None,
        false,
    );
    vm.start();
    run_frames(&mut vm, 1);
    assert_eq!(*out.lock().unwrap(), "B1\nA2\n");
    assert_eq!(vm.shreduler.now_system, 1.0);
}

#[test]
fn event_signal_wakes_at_signal_time() {
    let (mut vm, _ctl) = Vm::new(no_halt());
    vm.start();
    let ev = vm.store.new_event();
    vm.store.retain(ev);

    let w = vm.spork(
        VmCode::shared(
            "W",
            vec![Op::PushObj(ev), Op::WaitEvent, Op::Advance(1000.0)],
        ),
        None,
        false,
    );
    vm.spork(
        VmCode::shared(
            "S",
            vec![
                Op::Advance(100.0),
                Op::PushObj(ev),
                Op::SignalEvent,
                Op::Exit,
            ],
        ),
        None,
        false,
    );

    run_frames(&mut vm, 50);
    // W parked on the event, back pointer set, extra retain held
    assert_eq!(vm.store.event_state(ev).waiter_count(), 1);
    assert_eq!(vm.shred(w).unwrap().event, Some(ev));
    assert_eq!(vm.store.refcount(ev), 2);

    run_frames(&mut vm, 100);
    let shred = vm.shred(w).unwrap();
    assert_eq!(shred.reg.top().map(raw_to_float), Some(100.0));
    assert_eq!(shred.wake_time, 1100.0);
    assert_eq!(shred.event, None);
    assert_eq!(vm.store.event_state(ev).waiter_count(), 0);
    assert_eq!(vm.store.refcount(ev), 1);
}

#[test]
fn broadcast_wakes_all_in_enqueue_order() {
    let (mut vm, _ctl) = Vm::new(no_halt());
    let out = capture_chout(&mut vm);
    vm.start();
    let ev = vm.store.new_event();
    vm.store.retain(ev);

    for name in ["W1", "W2", "W3"] {
        vm.spork(
            VmCode::shared(
                name,
                vec![
                    Op::PushObj(ev),
                    Op::WaitEvent,
                    Op::Print(name.into()),
                    Op::Exit,
                ],
            ),
            None,
            false,
        );
    }
    vm.spork(
        VmCode::shared(
            "B",
            vec![
                Op::Advance(50.0),
                Op::PushObj(ev),
                Op::BroadcastEvent,
                Op::Exit,
            ],
        ),
        None,
        false,
    );

    run_frames(&mut vm, 60);
    assert_eq!(*out.lock().unwrap(), "W1\nW2\nW3\n");
    assert_eq!(vm.store.event_state(ev).waiter_count(), 0);
    assert_eq!(vm.store.refcount(ev), 1);
}

#[test]
fn k_signals_release_first_k_waiters_in_order() {
    let (mut vm, _ctl) = Vm::new(no_halt());
    let out = capture_chout(&mut vm);
    vm.start();
    let ev = vm.store.new_event();
    vm.store.retain(ev);

    for name in ["W1", "W2", "W3"] {
        vm.spork(
            VmCode::shared(
                name,
                vec![
                    Op::PushObj(ev),
                    Op::WaitEvent,
                    Op::Print(name.into()),
                    Op::Exit,
                ],
            ),
            None,
            false,
        );
    }
    vm.spork(
        VmCode::shared(
            "S",
            vec![
                Op::Advance(10.0),
                Op::PushObj(ev),
                Op::SignalEvent,
                Op::PushObj(ev),
                Op::SignalEvent,
                Op::Exit,
            ],
        ),
        None,
        false,
    );

    run_frames(&mut vm, 20);
    assert_eq!(*out.lock().unwrap(), "W1\nW2\n");
    assert_eq!(vm.store.event_state(ev).waiter_count(), 1);
    assert_eq!(
        vm.store.event_state(ev).waiters().collect::<Vec<_>>(),
        vec![ShredId(3)]
    );
}

#[test]
fn wait_queue_tracks_back_pointers() {
    let (mut vm, _ctl) = Vm::new(no_halt());
    vm.start();
    let ev = vm.store.new_event();
    vm.store.retain(ev);

    let ids: Vec<ShredId> = (0..3)
        .map(|i| {
            vm.spork(
                VmCode::shared(&format!("w{i}"), vec![Op::PushObj(ev), Op::WaitEvent]),
                None,
                false,
            )
        })
        .collect();
    run_frames(&mut vm, 1);

    let pointing = ids
        .iter()
        .filter(|id| vm.shred(**id).unwrap().event == Some(ev))
        .count();
    assert_eq!(pointing, vm.store.event_state(ev).waiter_count());
    assert_eq!(pointing, 3);
}

#[test]
fn removing_blocked_shred_forgets_event() {
    let (mut vm, _ctl) = Vm::new(no_halt());
    vm.start();
    let ev = vm.store.new_event();
    vm.store.retain(ev);

    let w = vm.spork(
        VmCode::shared("W", vec![Op::PushObj(ev), Op::WaitEvent]),
        None,
        false,
    );
    run_frames(&mut vm, 1);
    assert_eq!(vm.store.refcount(ev), 2);

    vm.remove_shred(w).unwrap();
    assert_eq!(vm.store.event_state(ev).waiter_count(), 0);
    assert_eq!(vm.store.refcount(ev), 1);
    assert!(vm.shred(w).is_none());
    assert_eq!(vm.num_dumped_shreds(), 1);
}

#[test]
fn can_wait_refusal_keeps_shred_running() {
    let (mut vm, _ctl) = Vm::new(no_halt());
    let out = capture_chout(&mut vm);
    vm.start();

    fn never_waits(_p: &crate::object::Payload) -> bool {
        false
    }
    let object = vm.store.builtins().object;
    let ty = vm.store.types_mut().register(TypeInfo {
        can_wait: Some(never_waits),
        ..TypeInfo::plain("NoWaitEvent", Some(object))
    });
    let ev = vm.store.new_event_of(ty);
    vm.store.retain(ev);

    let w = vm.spork(
        VmCode::shared(
            "W",
            vec![
                Op::PushObj(ev),
                Op::WaitEvent,
                Op::Print("ran".into()),
                Op::Advance(10.0),
            ],
        ),
        None,
        false,
    );
    run_frames(&mut vm, 1);
    assert_eq!(*out.lock().unwrap(), "ran\n");
    let shred = vm.shred(w).unwrap();
    assert_eq!(shred.event, None);
    assert_eq!(shred.reg.top().map(raw_to_float), Some(0.0));
    assert_eq!(vm.store.refcount(ev), 1);
}

#[test]
fn spork_op_links_parent_and_child() {
    let (mut vm, _ctl) = Vm::new(no_halt());
    let out = capture_chout(&mut vm);
    vm.start();

    let child = VmCode::shared("child", vec![Op::Print("child".into()), Op::Exit]);
    let parent = vm.spork(
        VmCode::shared(
            "parent",
            vec![Op::Spork(child), Op::Print("parent".into()), Op::Advance(10.0)],
        ),
        None,
        false,
    );
    run_frames(&mut vm, 1);

    // the parent keeps running through its slice; the child runs after it
    assert_eq!(*out.lock().unwrap(), "parent\nchild\n");
    let ps = vm.shred(parent).unwrap();
    assert_eq!(ps.reg.top(), Some(int_to_raw(2)));
    assert!(ps.children.is_empty(), "done child unlinks from parent");
}

#[test]
fn killing_parent_cascades_to_children() {
    let (mut vm, _ctl) = Vm::new(no_halt());
    vm.start();
    let child = VmCode::shared("child", vec![Op::Advance(1000.0)]);
    let parent = vm.spork(
        VmCode::shared("parent", vec![Op::Spork(child), Op::Advance(1000.0)]),
        None,
        false,
    );
    run_frames(&mut vm, 1);
    assert_eq!(vm.num_shreds(), 2);

    vm.remove_shred(parent).unwrap();
    assert_eq!(vm.num_shreds(), 0);
    assert_eq!(vm.num_dumped_shreds(), 2);
    assert_eq!(vm.shreduler.num_runnable(), 0);
}

#[test]
fn replace_keeps_id_and_single_status_entry() {
    let (mut vm, mut ctl) = Vm::new(no_halt());
    let out = capture_chout(&mut vm);
    vm.start();

    let id = vm.spork(
        VmCode::shared("old", vec![Op::Advance(5.0), Op::Print("old".into()), Op::Exit]),
        None,
        false,
    );
    run_frames(&mut vm, 1);

    ctl.queue_msg(Msg::Replace {
        id,
        code: VmCode::shared("new", vec![Op::Print("new".into()), Op::Advance(100.0)]),
    });
    ctl.queue_msg(Msg::Status);
    run_frames(&mut vm, 1);

    assert!(matches!(ctl.try_reply(), Some(Reply::Replaced(r)) if r == id));
    match ctl.try_reply() {
        Some(Reply::Status(status)) => {
            assert_eq!(status.list.len(), 1);
            assert_eq!(status.list[0].id, id);
            assert_eq!(status.list[0].name, "new");
        }
        other => panic!("unexpected reply: {other:?}"),
    }
    assert_eq!(*out.lock().unwrap(), "new\n");
    assert_eq!(vm.num_dumped_shreds(), 1);
}

#[test]
fn halt_on_empty_stops_at_exit_time() {
    let (mut vm, mut ctl) = Vm::new(VmConfig::default());
    vm.start();
    vm.spork(
        VmCode::shared("s", vec![Op::Advance(5.0), Op::Exit]),
        None,
        false,
    );
    assert!(!run_frames(&mut vm, 64));
    assert_eq!(vm.shreduler.now_system, 5.0);
    assert!(!vm.running());
    assert!(matches!(ctl.try_reply(), Some(Reply::Done)));
}

#[test]
fn pause_freezes_time() {
    let (mut vm, mut ctl) = Vm::new(no_halt());
    vm.start();
    vm.spork(VmCode::shared("s", vec![Op::Advance(1000.0)]), None, false);
    run_frames(&mut vm, 10);
    assert_eq!(vm.shreduler.now_system, 10.0);

    ctl.queue_msg(Msg::Pause(true));
    assert!(run_frames(&mut vm, 10));
    assert_eq!(vm.shreduler.now_system, 10.0);
    assert!(matches!(ctl.try_reply(), Some(Reply::Paused(false))));

    ctl.queue_msg(Msg::Pause(false));
    run_frames(&mut vm, 10);
    assert_eq!(vm.shreduler.now_system, 20.0);
    assert!(matches!(ctl.try_reply(), Some(Reply::Paused(true))));
}

#[test]
fn time_and_removeall_messages() {
    let (mut vm, mut ctl) = Vm::new(no_halt());
    vm.start();
    vm.spork(VmCode::shared("a", vec![Op::Advance(1000.0)]), None, false);
    vm.spork(VmCode::shared("b", vec![Op::Advance(1000.0)]), None, false);
    run_frames(&mut vm, 4);

    ctl.queue_msg(Msg::Time);
    ctl.queue_msg(Msg::RemoveAll);
    run_frames(&mut vm, 1);
    assert!(matches!(ctl.try_reply(), Some(Reply::Time(t)) if t == 4.0));
    assert!(matches!(ctl.try_reply(), Some(Reply::RemovedAll(2))));
    assert_eq!(vm.num_shreds(), 0);
}

#[test]
fn clear_vm_resets_id_allocator() {
    let (mut vm, _ctl) = Vm::new(no_halt());
    vm.start();
    vm.spork(VmCode::shared("a", vec![Op::Advance(1000.0)]), None, false);
    vm.spork(VmCode::shared("b", vec![Op::Advance(1000.0)]), None, false);
    assert!(matches!(
        vm.process_msg(Msg::ClearVm),
        Some(Reply::Cleared(2))
    ));
    let id = vm.spork(VmCode::shared("c", vec![Op::Advance(1.0)]), None, false);
    assert_eq!(id, ShredId(1));
}

#[test]
fn gc_releases_shred_owned_objects() {
    let (mut vm, _ctl) = Vm::new(no_halt());
    vm.start();
    let id = vm.spork(VmCode::shared("s", vec![Op::Advance(1000.0)]), None, false);
    run_frames(&mut vm, 1);

    let osc = vm.store.new_ugen("osc");
    vm.store.retain(osc);
    let this_obj = vm.store.new_string("receiver");
    vm.store.retain(this_obj);
    {
        let mut shred = vm.shreds.remove(&id).unwrap();
        shred.add_ugen(&mut vm.store, osc);
        shred.add_parent_ref(&mut vm.store, this_obj);
        vm.shreds.insert(id, shred);
    }
    assert_eq!(vm.store.refcount(osc), 2);
    assert_eq!(vm.store.refcount(this_obj), 2);

    vm.remove_shred(id).unwrap();
    // reclamation is deferred: nothing released until gc runs
    assert_eq!(vm.store.refcount(osc), 2);
    vm.gc_amount(0);
    assert_eq!(vm.store.refcount(osc), 2);
    vm.gc();
    assert_eq!(vm.store.refcount(osc), 1);
    assert_eq!(vm.store.refcount(this_obj), 1);
    assert!(!vm.store.ugen_mut(osc).connected);
    assert_eq!(vm.num_dumped_shreds(), 0);
    vm.store.release(osc);
    vm.store.release(this_obj);
}

#[test]
fn immediate_spork_runs_first_slice() {
    let (mut vm, _ctl) = Vm::new(no_halt());
    let out = capture_chout(&mut vm);
    let id = vm.spork(
        VmCode::shared("i", vec![Op::Print("now".into()), Op::Advance(10.0)]),
        None,
        true,
    );
    assert_eq!(*out.lock().unwrap(), "now\n");
    assert_eq!(vm.shred(id).unwrap().wake_time, 10.0);
}

#[test]
fn stack_overflow_terminates_only_the_shred() {
    let (mut vm, _ctl) = Vm::new(no_halt());
    let errs = quiet_cherr(&mut vm);
    vm.start();
    let ops: Vec<Op> = std::iter::repeat(Op::PushInt(7))
        .take(crate::shred::REG_STACK_WORDS + 1)
        .collect();
    let doomed = vm.spork(VmCode::shared("doomed", ops), None, false);
    let survivor = vm.spork(VmCode::shared("ok", vec![Op::Advance(100.0)]), None, false);
    run_frames(&mut vm, 1);

    assert!(vm.shred(doomed).is_none());
    assert!(vm.shred(survivor).is_some());
    assert!(errs.lock().unwrap().contains("register stack overflow"));
    assert!(vm.last_error().contains("register stack overflow"));
}

#[test]
fn queued_events_observed_next_tick() {
    let (mut vm, _ctl) = Vm::new(no_halt());
    vm.start();
    let ev = vm.store.new_event();
    vm.store.retain(ev);
    let mut producer = vm.create_event_buffer();

    let w = vm.spork(
        VmCode::shared("w", vec![Op::PushObj(ev), Op::WaitEvent, Op::Advance(500.0)]),
        None,
        false,
    );
    run_frames(&mut vm, 3);
    assert!(vm.shreduler.is_blocked(w));

    // a host thread queues the broadcast
    let handle = std::thread::spawn(move || {
        assert!(producer.queue_event(ev, 1));
        producer
    });
    let _producer = handle.join().unwrap();

    run_frames(&mut vm, 1);
    let shred = vm.shred(w).unwrap();
    assert!(!vm.shreduler.is_blocked(w));
    assert_eq!(shred.reg.top().map(raw_to_float), Some(3.0));
}

#[test]
fn adaptive_mode_never_overshoots_wakes() {
    let (mut vm, _ctl) = Vm::new(VmConfig {
        adaptive: 64,
        halt_on_empty: false,
        ..Default::default()
    });
    let out = capture_chout(&mut vm);
    vm.start();
    vm.spork(
        VmCode::shared(
            "s",
            vec![
                Op::Advance(10.0),
                Op::Print("t10".into()),
                Op::Advance(100.0),
                Op::Print("t110".into()),
                Op::Exit,
            ],
        ),
        None,
        false,
    );
    run_frames(&mut vm, 256);
    assert_eq!(*out.lock().unwrap(), "t10\nt110\n");
    assert_eq!(vm.shreduler.now_system, 256.0);
}

#[test]
fn shutdown_reclaims_everything() {
    let (mut vm, _ctl) = Vm::new(no_halt());
    vm.start();
    vm.spork(VmCode::shared("s", vec![Op::Advance(1000.0)]), None, false);
    run_frames(&mut vm, 1);
    vm.shutdown();
    vm.shutdown();
    assert_eq!(vm.num_shreds(), 0);
    assert!(vm.store.is_empty());
    assert!(!vm.running());
}
