//! Integration tests driving the full protocol stack: host wrappers over the
//! op table, boundary-side registry, and the scripted guest engine.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use innrun::engine::Dispatch;
use innrun::engine::ModuleSource;
use innrun::host::dispatch::CustomDispatcher;
use innrun::host::dispatch::Dispatcher;
use innrun::host::dispatch::StdDispatcher;
use innrun::host::isolate::Error as IsolateError;
use innrun::host::isolate::Isolate;
use innrun::host::isolate::IsolateOptions;
use innrun::host::loader::ModuleStore;
use innrun::host::loader::StdLoader;
use innrun::host::snapshot::Snapshot;
use innrun::native::Plugin;
use innrun::ops::OpTable;
use innrun::scripted::GuestLog;
use innrun::scripted::ScriptedEngine;

/// Boots a plugin around a scripted engine, returning the guest-side log too.
fn boot() -> (Plugin, GuestLog) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let engine = ScriptedEngine::new();
    let log = engine.log();
    (Plugin::new(Arc::new(engine)), log)
}

/// Pass-through loader for tests that never touch modules.
fn pass_loader(ops: &OpTable) -> StdLoader {
    StdLoader::new(
        ops,
        |specifier, _referrer, _is_root| Ok(specifier.to_string()),
        |specifier| {
            Ok(ModuleSource { module_name: specifier.to_string(), code: String::new() })
        },
    )
    .expect("Failed to create loader")
}

/// Custom dispatch capability recording every payload it sees.
struct Recorder {
    seen: Arc<Mutex<Vec<String>>>,
    reply: &'static str,
}

impl Recorder {
    fn new(reply: &'static str) -> (Self, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        (Self { seen: seen.clone(), reply }, seen)
    }
}

#[async_trait::async_trait]
impl Dispatch for Recorder {
    async fn dispatch(&self, data: &[u8], zero_copy: Option<&[u8]>) -> anyhow::Result<Vec<u8>> {
        let mut entry = String::from_utf8_lossy(data).to_string();
        if let Some(raw) = zero_copy {
            entry.push_str(" +");
            entry.push_str(&String::from_utf8_lossy(raw));
        }
        self.seen.lock().unwrap().push(entry);
        Ok(self.reply.as_bytes().to_vec())
    }
}

// --- Test 1: Standard dispatcher round trip ---

#[tokio::test]
async fn test_std_dispatcher_round_trip() {
    let (plugin, log) = boot();
    let ops = plugin.ops();
    let loader = pass_loader(&ops);
    let isolate = Isolate::new(&ops, &loader, IsolateOptions::default()).unwrap();

    let dispatcher = StdDispatcher::new(&ops).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let callback_seen = seen.clone();
    dispatcher.set_ondispatch(move |data, _zero_copy| {
        callback_seen.lock().unwrap().push(data.to_vec());
        Ok(b"Hello World!".to_vec())
    });
    isolate.register_op("testOpJs", &dispatcher).unwrap();

    isolate.execute("dispatch testOpJs test").await.unwrap();

    // Exactly one callback invocation, with the guest's payload verbatim.
    assert_eq!(*seen.lock().unwrap(), vec![vec![116, 101, 115, 116]]);
    // The guest observed the response bytes.
    assert_eq!(log.entries(), vec!["testOpJs -> Hello World!".to_string()]);
}

// --- Test 2: Two named ops route to their own dispatchers ---

#[tokio::test]
async fn test_two_named_ops_route_independently() {
    let (plugin, log) = boot();
    let ops = plugin.ops();
    let loader = pass_loader(&ops);
    let isolate = Isolate::new(&ops, &loader, IsolateOptions::default()).unwrap();

    let (recorder, custom_seen) = Recorder::new("test1234");
    let custom = CustomDispatcher::from_rid(plugin.register_dispatcher(Arc::new(recorder)));

    let std_dispatcher = StdDispatcher::new(&ops).unwrap();
    let std_seen = Arc::new(Mutex::new(Vec::new()));
    let callback_seen = std_seen.clone();
    std_dispatcher.set_ondispatch(move |data, _zero_copy| {
        callback_seen.lock().unwrap().push(String::from_utf8_lossy(data).to_string());
        Ok(b"Hello World!".to_vec())
    });

    isolate.register_op("testOp", &custom).unwrap();
    isolate.register_op("testOpJs", &std_dispatcher).unwrap();

    isolate
        .execute("dispatch testOp test\ndispatch testOpJs test")
        .await
        .unwrap();

    assert_eq!(*custom_seen.lock().unwrap(), vec!["test".to_string()]);
    assert_eq!(*std_seen.lock().unwrap(), vec!["test".to_string()]);
    assert_eq!(
        log.entries(),
        vec!["testOp -> test1234".to_string(), "testOpJs -> Hello World!".to_string()]
    );
}

// --- Test 3: Module execution resolves, then loads ---

#[tokio::test]
async fn test_loader_resolves_root_then_loads() {
    let (plugin, log) = boot();
    let ops = plugin.ops();

    let events = Arc::new(Mutex::new(Vec::new()));
    let resolve_events = events.clone();
    let load_events = events.clone();
    let loader = StdLoader::new(
        &ops,
        move |specifier, referrer, is_root| {
            resolve_events
                .lock()
                .unwrap()
                .push(format!("resolve {specifier} '{referrer}' {is_root}"));
            Ok("file:///testmod.js".to_string())
        },
        move |specifier| {
            load_events.lock().unwrap().push(format!("load {specifier}"));
            Ok(ModuleSource {
                module_name: specifier.to_string(),
                code: "dispatch modOp loaded".to_string(),
            })
        },
    )
    .unwrap();

    let isolate = Isolate::new(&ops, &loader, IsolateOptions::default()).unwrap();
    let (recorder, _seen) = Recorder::new("ok");
    let custom = CustomDispatcher::from_rid(plugin.register_dispatcher(Arc::new(recorder)));
    isolate.register_op("modOp", &custom).unwrap();

    isolate.execute_module("test").await.unwrap();

    assert_eq!(
        *events.lock().unwrap(),
        vec![
            "resolve test '' true".to_string(),
            "load file:///testmod.js".to_string(),
        ]
    );
    assert_eq!(log.entries(), vec!["modOp -> ok".to_string()]);
}

// --- Test 4: Snapshot refused unless enabled up front ---

#[tokio::test]
async fn test_snapshot_refused_when_disabled() {
    let (plugin, _log) = boot();
    let ops = plugin.ops();
    let loader = pass_loader(&ops);
    let isolate = Isolate::new(
        &ops,
        &loader,
        IsolateOptions { will_snapshot: false, snapshot: None },
    )
    .unwrap();

    match isolate.snapshot() {
        Err(IsolateError::SnapshotDisabled) => {}
        other => panic!("Expected SnapshotDisabled, got {:?}", other.map(|s| s.rid())),
    }
}

// --- Test 5: Snapshot restore is observably equivalent ---

#[tokio::test]
async fn test_snapshot_restore_equivalence() {
    const DEFS: &str = "def main\n  dispatch testOp alpha\n  dispatch testOp beta\nend";

    let (plugin, _log) = boot();
    let ops = plugin.ops();
    let loader = pass_loader(&ops);

    // Straight-line run: evaluate the definitions, then invoke main().
    let direct = Isolate::new(&ops, &loader, IsolateOptions::default()).unwrap();
    let (recorder, direct_seen) = Recorder::new("ok");
    let custom = CustomDispatcher::from_rid(plugin.register_dispatcher(Arc::new(recorder)));
    direct.register_op("testOp", &custom).unwrap();
    direct.execute(DEFS).await.unwrap();
    direct.execute("main()").await.unwrap();

    // Snapshot run: capture after the definitions, restore, then invoke main().
    let origin = Isolate::new(
        &ops,
        &loader,
        IsolateOptions { will_snapshot: true, snapshot: None },
    )
    .unwrap();
    origin.execute(DEFS).await.unwrap();
    let snapshot = origin.snapshot().unwrap();

    let restored = Isolate::new(
        &ops,
        &loader,
        IsolateOptions { will_snapshot: false, snapshot: Some(&snapshot) },
    )
    .unwrap();
    let (recorder, restored_seen) = Recorder::new("ok");
    let custom = CustomDispatcher::from_rid(plugin.register_dispatcher(Arc::new(recorder)));
    restored.register_op("testOp", &custom).unwrap();
    restored.execute("main()").await.unwrap();

    assert_eq!(*direct_seen.lock().unwrap(), *restored_seen.lock().unwrap());
    assert_eq!(
        *restored_seen.lock().unwrap(),
        vec!["alpha".to_string(), "beta".to_string()]
    );
}

// --- Test 6: One snapshot handle serves many restores ---

#[tokio::test]
async fn test_snapshot_restores_repeatedly() {
    const DEFS: &str = "def main\n  dispatch testOp again\nend";

    let (plugin, _log) = boot();
    let ops = plugin.ops();
    let loader = pass_loader(&ops);

    let origin = Isolate::new(
        &ops,
        &loader,
        IsolateOptions { will_snapshot: true, snapshot: None },
    )
    .unwrap();
    origin.execute(DEFS).await.unwrap();
    let snapshot = origin.snapshot().unwrap();

    for _ in 0..5 {
        let restored = Isolate::new(
            &ops,
            &loader,
            IsolateOptions { will_snapshot: false, snapshot: Some(&snapshot) },
        )
        .unwrap();
        let (recorder, seen) = Recorder::new("ok");
        let custom =
            CustomDispatcher::from_rid(plugin.register_dispatcher(Arc::new(recorder)));
        restored.register_op("testOp", &custom).unwrap();
        restored.execute("main()").await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["again".to_string()]);
    }
}

// --- Test 7: Snapshot reads are idempotent ---

#[tokio::test]
async fn test_snapshot_read_idempotent() {
    let (plugin, _log) = boot();
    let ops = plugin.ops();

    let snapshot = Snapshot::from_bytes(&ops, b"opaque-state").unwrap();
    let first = snapshot.read().unwrap();
    let second = snapshot.read().unwrap();

    assert_eq!(first, b"opaque-state");
    assert_eq!(first, second);

    // Same holds for a snapshot captured from an isolate.
    let loader = pass_loader(&ops);
    let isolate = Isolate::new(
        &ops,
        &loader,
        IsolateOptions { will_snapshot: true, snapshot: None },
    )
    .unwrap();
    isolate.execute("def main\nend").await.unwrap();
    let captured = isolate.snapshot().unwrap();
    assert_eq!(captured.read().unwrap(), captured.read().unwrap());
}

// --- Test 8: Commands are strictly sequential per dispatcher ---

#[tokio::test]
async fn test_dispatcher_commands_are_sequential() {
    let (plugin, log) = boot();
    let ops = plugin.ops();
    let loader = pass_loader(&ops);
    let isolate = Isolate::new(&ops, &loader, IsolateOptions::default()).unwrap();

    let dispatcher = StdDispatcher::new(&ops).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let callback_seen = seen.clone();
    dispatcher.set_ondispatch(move |data, _zero_copy| {
        let payload = String::from_utf8_lossy(data).to_string();
        callback_seen.lock().unwrap().push(payload.clone());
        Ok(format!("ack-{payload}").into_bytes())
    });
    isolate.register_op("seqOp", &dispatcher).unwrap();

    isolate
        .execute("dispatch seqOp one\ndispatch seqOp two\ndispatch seqOp three")
        .await
        .unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        vec!["one".to_string(), "two".to_string(), "three".to_string()]
    );
    assert_eq!(
        log.entries(),
        vec![
            "seqOp -> ack-one".to_string(),
            "seqOp -> ack-two".to_string(),
            "seqOp -> ack-three".to_string(),
        ]
    );
}

// --- Test 9: Zero-copy buffer rides alongside the payload ---

#[tokio::test]
async fn test_zero_copy_buffer_reaches_dispatcher() {
    let (plugin, log) = boot();
    let ops = plugin.ops();
    let loader = pass_loader(&ops);
    let isolate = Isolate::new(&ops, &loader, IsolateOptions::default()).unwrap();

    let dispatcher = StdDispatcher::new(&ops).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let callback_seen = seen.clone();
    dispatcher.set_ondispatch(move |data, zero_copy| {
        callback_seen.lock().unwrap().push((
            String::from_utf8_lossy(data).to_string(),
            zero_copy.map(|raw| String::from_utf8_lossy(raw).to_string()),
        ));
        Ok(b"ok".to_vec())
    });
    isolate.register_op("bulkOp", &dispatcher).unwrap();

    isolate.execute("dispatchraw bulkOp header body").await.unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![("header".to_string(), Some("body".to_string()))]
    );
    assert_eq!(log.entries(), vec!["bulkOp -> ok".to_string()]);
}

// --- Test 10: Spawned work waits for the completion join ---

#[tokio::test]
async fn test_spawned_work_runs_at_drain() {
    let (plugin, _log) = boot();
    let ops = plugin.ops();
    let loader = pass_loader(&ops);
    let isolate = Isolate::new(&ops, &loader, IsolateOptions::default()).unwrap();

    let (recorder, seen) = Recorder::new("ok");
    let custom = CustomDispatcher::from_rid(plugin.register_dispatcher(Arc::new(recorder)));
    isolate.register_op("lateOp", &custom).unwrap();

    isolate
        .execute("def later\n  dispatch lateOp deferred\nend\nspawn later")
        .await
        .unwrap();
    // Initial evaluation returned with the callback still queued.
    assert!(seen.lock().unwrap().is_empty());

    isolate.run().await.unwrap();
    assert_eq!(*seen.lock().unwrap(), vec!["deferred".to_string()]);

    // Completion is terminal.
    match isolate.execute("dispatch lateOp again").await {
        Err(IsolateError::Complete) => {}
        other => panic!("Expected Complete, got {:?}", other.err()),
    }
}

// --- Test 11: Ops against unknown handles fail as op errors ---

#[tokio::test]
async fn test_unknown_handle_is_an_op_error() {
    let (plugin, _log) = boot();
    let ops = plugin.ops();

    let wait_op = ops.load("std_dispatcher_wait_for_dispatch").unwrap();
    let bytes = wait_op.call_async(br#"{"rid": 424242}"#, None).await.unwrap();
    let err = innwire::decode_data::<innwire::Empty>(&bytes).unwrap_err();

    assert_eq!(err, innwire::Error::Op("Resource not found: rid-424242".to_string()));
}

// --- Test 12: Responding to an unknown command fails ---

#[tokio::test]
async fn test_respond_to_unknown_command_fails() {
    let (plugin, _log) = boot();
    let ops = plugin.ops();
    let dispatcher = StdDispatcher::new(&ops).unwrap();

    let respond_op = ops.load("std_dispatcher_respond").unwrap();
    let payload = format!(r#"{{"rid": {}, "cmd_id": 999}}"#, dispatcher.std_rid().0);
    let bytes = respond_op.call_sync(payload.as_bytes(), Some(b"late")).unwrap();
    let err = innwire::decode_data::<innwire::Empty>(&bytes).unwrap_err();

    assert!(matches!(err, innwire::Error::Op(msg) if msg.contains("no pending command 999")));
}

// --- Test 13: A command before ondispatch is configured stalls the guest ---

#[tokio::test(start_paused = true)]
async fn test_command_before_ondispatch_terminates_service() {
    let (plugin, _log) = boot();
    let ops = plugin.ops();
    let loader = pass_loader(&ops);
    let isolate = Isolate::new(&ops, &loader, IsolateOptions::default()).unwrap();

    // No ondispatch installed: the pump terminates and the command is never
    // answered, so the guest's dispatch stays parked.
    let dispatcher = StdDispatcher::new(&ops).unwrap();
    isolate.register_op("earlyOp", &dispatcher).unwrap();

    let result =
        tokio::time::timeout(Duration::from_secs(1), isolate.execute("dispatch earlyOp hello"))
            .await;
    assert!(result.is_err(), "Guest should never receive a response");
}

// --- Test 14: Module store elides repeat loads ---

#[tokio::test]
async fn test_module_store_serves_repeat_loads() {
    let (plugin, log) = boot();
    let ops = plugin.ops();

    let resolves = Arc::new(Mutex::new(0u32));
    let loads = Arc::new(Mutex::new(0u32));
    let resolve_count = resolves.clone();
    let load_count = loads.clone();
    let loader = StdLoader::new(
        &ops,
        move |specifier, _referrer, _is_root| {
            *resolve_count.lock().unwrap() += 1;
            Ok(format!("file:///{specifier}.js"))
        },
        move |specifier| {
            *load_count.lock().unwrap() += 1;
            Ok(ModuleSource {
                module_name: specifier.to_string(),
                code: "dispatch cacheOp ran".to_string(),
            })
        },
    )
    .unwrap();

    let store = ModuleStore::new(&ops).unwrap();
    let (recorder, _seen) = Recorder::new("ok");
    let custom_rid = plugin.register_dispatcher(Arc::new(recorder));

    for _ in 0..2 {
        let isolate = Isolate::new(&ops, &loader, IsolateOptions::default()).unwrap();
        let custom = CustomDispatcher::from_rid(custom_rid);
        isolate.register_op("cacheOp", &custom).unwrap();
        isolate.execute_module_with_store("cached", &store).await.unwrap();
    }

    // Both runs resolved, only the first paid for a load.
    assert_eq!(*resolves.lock().unwrap(), 2);
    assert_eq!(*loads.lock().unwrap(), 1);
    assert_eq!(
        log.entries(),
        vec!["cacheOp -> ok".to_string(), "cacheOp -> ok".to_string()]
    );
}

// --- Test 15: Closed resources vanish from the registry ---

#[tokio::test]
async fn test_close_resource_invalidates_handle() {
    let (plugin, _log) = boot();
    let ops = plugin.ops();
    let loader = pass_loader(&ops);
    let isolate = Isolate::new(&ops, &loader, IsolateOptions::default()).unwrap();

    let dispatcher = StdDispatcher::new(&ops).unwrap();
    dispatcher.set_ondispatch(|_data, _zero_copy| Ok(Vec::new()));

    let close_op = ops.load("close_resource").unwrap();
    let payload = format!(r#"{{"rid": {}}}"#, dispatcher.rid().0);
    let bytes = close_op.call_sync(payload.as_bytes(), None).unwrap();
    innwire::decode_data::<innwire::Empty>(&bytes).unwrap();

    match isolate.register_op("goneOp", &dispatcher) {
        Err(IsolateError::Call(e)) => {
            assert!(e.to_string().contains("Resource not found"));
        }
        other => panic!("Expected a call error, got {:?}", other.err()),
    }
}
