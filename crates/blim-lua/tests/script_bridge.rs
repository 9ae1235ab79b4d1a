//! End-to-end tests for scripts driving an in-memory peripheral.
//!
//! Every test builds a fresh engine with the `blim` API installed over a
//! [`MemoryPeripheral`], runs Lua through the public entry points, and
//! inspects output records, globals and device state from the host side.

use blim_device::testing::MemoryPeripheral;
use blim_device::{
    CharacteristicInfo, Connection, Device, DeviceError, DeviceInfo, NotificationSink, Properties,
    RegistrationId, ServiceInfo, SubscribeOptions,
};
use blim_lua::{BleApi, CallbackTable, ErrorKind, ExecContext, ScriptEngine, ScriptError};
use blim_runtime::output::{OutputRecord, OutputSource};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::{fmt, EnvFilter};

fn peripheral() -> Arc<MemoryPeripheral> {
    let p = MemoryPeripheral::new("hrm");
    p.add_service("180d", Some("Heart Rate"));
    p.add_characteristic(
        CharacteristicInfo::new("180d", "2a37", Properties::NOTIFY)
            .with_name("Heart Rate Measurement"),
    );
    p.add_characteristic(CharacteristicInfo::new(
        "180d",
        "2a39",
        Properties::READ | Properties::WRITE,
    ));
    p
}

/// Logs to the test writer when `RUST_LOG` is set.
fn init_tracing() {
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn bridge(device: Arc<dyn Device>) -> (ScriptEngine, Arc<BleApi>) {
    init_tracing();
    let engine = ScriptEngine::with_defaults().expect("engine");
    let api = Arc::new(BleApi::with_defaults(device, &engine));
    engine.install(api.clone()).expect("install api");
    (engine, api)
}

fn run(engine: &ScriptEngine, code: &str) -> Result<(), ScriptError> {
    engine.execute_script(&ExecContext::background(), code)
}

fn drain(engine: &ScriptEngine) -> Vec<OutputRecord> {
    let pipe = engine.output();
    std::iter::from_fn(|| pipe.try_recv()).collect()
}

fn text(records: &[OutputRecord], source: OutputSource) -> String {
    records
        .iter()
        .filter(|r| r.source == source)
        .map(|r| r.content.as_str())
        .collect()
}

fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn subscription_id(engine: &ScriptEngine) -> blim_lua::SubscriptionId {
    let id = engine.global_integer("id").unwrap().expect("id set");
    blim_lua::SubscriptionId(u64::try_from(id).unwrap())
}

// --- scripts ---

#[test]
fn prints_reach_stdout() {
    let (engine, _) = bridge(peripheral());
    run(&engine, r#"print("hello")"#).unwrap();
    assert_eq!(text(&drain(&engine), OutputSource::Stdout), "hello\n");
}

#[test]
fn syntax_error_is_reported_on_stderr() {
    let (engine, _) = bridge(peripheral());
    let err = run(&engine, "print(").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Syntax);
    let stderr = text(&drain(&engine), OutputSource::Stderr);
    assert!(stderr.contains(&err.message), "stderr was {stderr:?}");
}

#[test]
fn api_reachable_as_ble_alias() {
    let (engine, _) = bridge(peripheral());
    run(
        &engine,
        r#"
        same = rawequal(blim, ble)
        name = ble.device.name
        local svcs = blim.list()
        first = svcs[1].uuid
        "#,
    )
    .unwrap();
    assert_eq!(engine.global("same").unwrap(), json!(true));
    assert_eq!(engine.global_string("name").unwrap().as_deref(), Some("hrm"));
    assert_eq!(engine.global_string("first").unwrap().as_deref(), Some("180d"));
}

#[test]
fn device_snapshot_reflects_advertisement() {
    let p = peripheral();
    p.set_info(DeviceInfo {
        id: "id-1".into(),
        address: "AA:BB:CC:DD:EE:FF".into(),
        name: "strap".into(),
        rssi: -42,
        tx_power: Some(4),
        connectable: true,
        manufacturer_data: vec![0x4c, 0x00],
        ..DeviceInfo::default()
    });
    let (engine, _) = bridge(p);
    run(
        &engine,
        "rssi = blim.device.rssi; tx = blim.device.tx_power; mfg = blim.device.manufacturer_data.value",
    )
    .unwrap();
    assert_eq!(engine.global_integer("rssi").unwrap(), Some(-42));
    assert_eq!(engine.global_integer("tx").unwrap(), Some(4));
    assert_eq!(engine.global_string("mfg").unwrap().as_deref(), Some("4C00"));
}

#[test]
fn cyclic_tables_fail_without_crashing() {
    let (engine, _) = bridge(peripheral());
    run(
        &engine,
        r#"
        local t = { name = "loop" }
        t.me = t
        ok, err = pcall(json.encode, t)
        ring = t
        "#,
    )
    .unwrap();
    assert_eq!(engine.global("ok").unwrap(), json!(false));
    let err = engine.global_string("err").unwrap().unwrap();
    assert!(err.contains("json.encode() failed"), "{err}");
    assert!(err.contains("recursive table"), "{err}");

    let err = engine.global("ring").unwrap_err();
    assert!(err.message.contains("recursive table"), "{err}");
    run(&engine, "after = 1").unwrap();
}

#[test]
fn loop_in_nested_coroutine_is_cancelled() {
    let p = peripheral();
    let (engine, api) = bridge(p.clone());
    run(
        &engine,
        r#"
        hits = 0
        id = blim.subscribe{
            services = { { service = "180d", chars = { "2a37" } } },
            Callback = function() hits = hits + 1 end,
        }
        "#,
    )
    .unwrap();

    let started = Instant::now();
    let err = engine
        .execute_script(
            &ExecContext::with_timeout(Duration::from_millis(100)),
            "coroutine.wrap(function() while true do end end)()",
        )
        .unwrap_err();
    assert!(err.is_cancelled(), "{err}");
    assert!(started.elapsed() < Duration::from_secs(2));

    // the lock is free again, so callbacks still run
    p.notify("180d", "2a37", &[1]);
    let id = subscription_id(&engine);
    assert!(wait_for(|| api.dispatcher().stats(id).unwrap().delivered == 1));
    assert_eq!(engine.global_integer("hits").unwrap(), Some(1));
}

// --- characteristic I/O ---

#[test]
fn read_and_write_from_script() {
    let p = peripheral();
    p.set_read_value("180d", "2a39", vec![0x01, 0x02]);
    let (engine, _) = bridge(p.clone());
    run(
        &engine,
        r#"
        local c = blim.characteristic("180D", "2A39")
        local v, err = c.read()
        len = #v
        read_err = err
        ok = c:write("\x05", false)
        "#,
    )
    .unwrap();
    assert_eq!(engine.global_integer("len").unwrap(), Some(2));
    assert_eq!(engine.global("read_err").unwrap(), serde_json::Value::Null);
    assert_eq!(engine.global("ok").unwrap(), json!(true));

    let writes = p.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].data, vec![0x05]);
    assert!(!writes[0].with_response);
}

#[test]
fn failed_read_returns_nil_and_message() {
    let p = peripheral();
    p.fail_reads("180d", "2a39", DeviceError::Transport("link lost".into()));
    let (engine, _) = bridge(p);
    run(
        &engine,
        r#"v, err = blim.characteristic("180d", "2a39").read()"#,
    )
    .unwrap();
    assert_eq!(engine.global("v").unwrap(), serde_json::Value::Null);
    let err = engine.global_string("err").unwrap().unwrap();
    assert!(err.starts_with("read() failed: "), "{err}");
}

/// Delegates to a [`MemoryPeripheral`], holding every read and subscribe
/// for a while. Subscribing panics once `broken` is set.
struct SlowLink {
    inner: Arc<MemoryPeripheral>,
    this: std::sync::Weak<SlowLink>,
    read_delay: Duration,
    subscribe_delay: Duration,
    reading: AtomicBool,
    subscribing: AtomicBool,
    broken: AtomicBool,
}

impl SlowLink {
    fn new(
        inner: Arc<MemoryPeripheral>,
        read_delay: Duration,
        subscribe_delay: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            inner,
            this: this.clone(),
            read_delay,
            subscribe_delay,
            reading: AtomicBool::new(false),
            subscribing: AtomicBool::new(false),
            broken: AtomicBool::new(false),
        })
    }
}

impl Device for SlowLink {
    fn info(&self) -> DeviceInfo {
        self.inner.info()
    }

    fn connection(&self) -> Option<Arc<dyn Connection>> {
        Some(self.this.upgrade()? as Arc<dyn Connection>)
    }
}

impl Connection for SlowLink {
    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    fn services(&self) -> Vec<ServiceInfo> {
        self.inner.services()
    }

    fn characteristic(
        &self,
        service: &str,
        characteristic: &str,
    ) -> Result<CharacteristicInfo, DeviceError> {
        self.inner.characteristic(service, characteristic)
    }

    fn read(
        &self,
        service: &str,
        characteristic: &str,
        timeout: Duration,
    ) -> Result<Vec<u8>, DeviceError> {
        self.reading.store(true, Ordering::SeqCst);
        thread::sleep(self.read_delay);
        self.reading.store(false, Ordering::SeqCst);
        self.inner.read(service, characteristic, timeout)
    }

    fn write(
        &self,
        service: &str,
        characteristic: &str,
        data: &[u8],
        with_response: bool,
        timeout: Duration,
    ) -> Result<(), DeviceError> {
        self.inner
            .write(service, characteristic, data, with_response, timeout)
    }

    fn parse(
        &self,
        service: &str,
        characteristic: &str,
        value: &[u8],
    ) -> Result<Option<serde_json::Value>, DeviceError> {
        self.inner.parse(service, characteristic, value)
    }

    fn subscribe(
        &self,
        selectors: &[SubscribeOptions],
        sink: Arc<dyn NotificationSink>,
    ) -> Result<RegistrationId, DeviceError> {
        if self.broken.load(Ordering::SeqCst) {
            panic!("radio driver state corrupted");
        }
        self.subscribing.store(true, Ordering::SeqCst);
        thread::sleep(self.subscribe_delay);
        self.subscribing.store(false, Ordering::SeqCst);
        self.inner.subscribe(selectors, sink)
    }

    fn unsubscribe(&self, registration: RegistrationId) {
        self.inner.unsubscribe(registration);
    }
}

#[test]
fn engine_stays_available_during_read() {
    let p = peripheral();
    p.set_read_value("180d", "2a39", vec![9]);
    let link = SlowLink::new(p, Duration::from_millis(300), Duration::ZERO);
    let (engine, _) = bridge(link.clone());

    let script = {
        let engine = engine.clone();
        thread::spawn(move || {
            run(&engine, r#"value = blim.characteristic("180d", "2a39").read()"#)
        })
    };

    assert!(wait_for(|| link.reading.load(Ordering::SeqCst)));
    let started = Instant::now();
    engine.run_exclusive(|_| Ok(())).unwrap();
    assert!(started.elapsed() < Duration::from_millis(200));

    script.join().unwrap().unwrap();
    assert_eq!(engine.global_string("value").unwrap().as_deref(), Some("\u{9}"));
}

// --- subscriptions ---

#[test]
fn unknown_service_fails_subscription() {
    let (engine, api) = bridge(peripheral());
    let err = run(
        &engine,
        r#"blim.subscribe{
            services = { { service = "1234", chars = { "5678" } } },
            Callback = function() end,
        }"#,
    )
    .unwrap_err();
    assert!(err.message.contains("not found"), "{err}");
    assert!(err.message.contains("Error executing subscription"), "{err}");
    assert_eq!(api.dispatcher().active_count(), 0);
}

#[test]
fn missing_callback_is_rejected() {
    let (engine, _) = bridge(peripheral());
    let err = run(
        &engine,
        r#"blim.subscribe{ services = { { service = "180d", chars = { "2a37" } } } }"#,
    )
    .unwrap_err();
    assert!(err.message.starts_with("Error executing subscription: "), "{err}");
}

#[test]
fn notification_arrives_during_sleep() {
    let p = peripheral();
    let (engine, _) = bridge(p.clone());

    let injector = {
        let p = p.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            p.notify("180d", "2a37", &[0x00, 72]);
        })
    };
    run(
        &engine,
        r#"
        flag = false
        blim.subscribe{
            services = { { service = "180d", chars = { "2a37" } } },
            Callback = function(r) flag = true; bpm = r.Values["2a37"]:byte(2) end,
        }
        blim.sleep(100)
        "#,
    )
    .unwrap();
    injector.join().unwrap();

    assert!(wait_for(|| engine.global("flag").unwrap() == json!(true)));
    assert_eq!(engine.global_integer("bpm").unwrap(), Some(72));
}

#[test]
fn failing_callback_is_isolated() {
    let p = peripheral();
    let (engine, api) = bridge(p.clone());
    run(
        &engine,
        r#"
        good = 0
        bad_id = blim.subscribe{
            services = { { service = "180d", chars = { "2a37" } } },
            Callback = function() error("boom") end,
        }
        id = blim.subscribe{
            services = { { service = "180d", chars = { "2a37" } } },
            Callback = function() good = good + 1 end,
        }
        "#,
    )
    .unwrap();

    for v in 0..10u8 {
        assert_eq!(p.notify("180d", "2a37", &[v]), 2);
        thread::sleep(Duration::from_millis(2));
    }

    let good_id = subscription_id(&engine);
    let dispatcher = api.dispatcher();
    assert!(wait_for(|| dispatcher.stats(good_id).unwrap().delivered == 10));
    assert_eq!(engine.global_integer("good").unwrap(), Some(10));

    let mut records = Vec::new();
    assert!(wait_for(|| {
        records.extend(drain(&engine));
        records
            .iter()
            .filter(|r| r.source == OutputSource::Stderr && r.content.starts_with("Callback error"))
            .count()
            == 10
    }));
}

#[test]
fn aggregated_delivers_latest_value_per_window() {
    let p = peripheral();
    let (engine, api) = bridge(p.clone());
    run(
        &engine,
        r#"
        calls = 0
        id = blim.subscribe{
            services = { { service = "180d", chars = { "2a37" } } },
            Mode = "Aggregated", MaxRate = 100,
            Callback = function(r) calls = calls + 1; last = r.Values["2a37"]:byte(1) end,
        }
        "#,
    )
    .unwrap();

    for v in 1..=50u8 {
        p.notify("180d", "2a37", &[v]);
    }
    let id = subscription_id(&engine);
    assert!(wait_for(|| api.dispatcher().stats(id).unwrap().delivered >= 1));
    thread::sleep(Duration::from_millis(250));

    assert_eq!(engine.global_integer("calls").unwrap(), Some(1));
    assert_eq!(engine.global_integer("last").unwrap(), Some(50));
}

#[test]
fn batched_keeps_arrival_order() {
    let p = peripheral();
    let (engine, api) = bridge(p.clone());
    run(
        &engine,
        r#"
        seen = {}
        id = blim.subscribe{
            services = { { service = "180d", chars = { "2a37" } } },
            Mode = "Batched", MaxRate = 100,
            Callback = function(r)
                for _, v in ipairs(r.BatchValues["2a37"]) do seen[#seen + 1] = v:byte(1) end
            end,
        }
        "#,
    )
    .unwrap();

    for v in 1..=3u8 {
        p.notify("180d", "2a37", &[v]);
    }
    let id = subscription_id(&engine);
    assert!(wait_for(|| api.dispatcher().stats(id).unwrap().delivered == 1));
    assert_eq!(engine.global("seen").unwrap(), json!([1, 2, 3]));
}

#[test]
fn unsubscribe_stops_delivery() {
    let p = peripheral();
    let (engine, api) = bridge(p.clone());
    run(
        &engine,
        r#"
        id = blim.subscribe{
            services = { { service = "180d", chars = { "2a37" } } },
            Callback = function() end,
        }
        first = blim.unsubscribe(id)
        second = blim.unsubscribe(id)
        "#,
    )
    .unwrap();
    assert_eq!(engine.global("first").unwrap(), json!(true));
    assert_eq!(engine.global("second").unwrap(), json!(false));

    api.dispatcher().join();
    assert_eq!(p.registration_count(), 0);
    assert_eq!(p.notify("180d", "2a37", &[1]), 0);
}

#[test]
fn reset_cancels_subscriptions() {
    let p = peripheral();
    let (engine, api) = bridge(p.clone());
    run(
        &engine,
        r#"blim.subscribe{
            services = { { service = "180d", chars = { "2a37" } } },
            Callback = function() end,
        }"#,
    )
    .unwrap();
    assert_eq!(api.dispatcher().active_count(), 1);

    engine.reset().unwrap();
    assert_eq!(api.dispatcher().active_count(), 0);
    api.dispatcher().join();
    assert_eq!(p.registration_count(), 0);

    // the API is installed again on the fresh runtime
    run(&engine, "kind = type(blim.subscribe)").unwrap();
    assert_eq!(engine.global_string("kind").unwrap().as_deref(), Some("function"));
}

#[test]
fn max_rate_spacing_survives_lock_contention() {
    let p = peripheral();
    let (engine, api) = bridge(p.clone());
    run(
        &engine,
        r#"
        calls = 0
        id = blim.subscribe{
            services = { { service = "180d", chars = { "2a37" } } },
            MaxRate = 100,
            Callback = function() calls = calls + 1 end,
        }
        "#,
    )
    .unwrap();
    let id = subscription_id(&engine);

    // both notifications come due while something else holds the engine
    engine
        .run_exclusive(|_| {
            p.notify("180d", "2a37", &[1]);
            thread::sleep(Duration::from_millis(20));
            p.notify("180d", "2a37", &[2]);
            thread::sleep(Duration::from_millis(110));
            Ok(())
        })
        .unwrap();
    let released = Instant::now();

    assert!(wait_for(|| api.dispatcher().stats(id).unwrap().delivered >= 1));
    assert!(wait_for(|| api.dispatcher().stats(id).unwrap().delivered == 2));
    let gap = released.elapsed();
    assert!(gap >= Duration::from_millis(95), "second callback after {gap:?}");
    assert_eq!(engine.global_integer("calls").unwrap(), Some(2));
}

#[test]
fn reset_during_subscribe_leaves_nothing_registered() {
    let p = peripheral();
    let link = SlowLink::new(p.clone(), Duration::ZERO, Duration::from_millis(150));
    let (engine, api) = bridge(link.clone());

    let script = {
        let engine = engine.clone();
        thread::spawn(move || {
            run(
                &engine,
                r#"blim.subscribe{
                    services = { { service = "180d", chars = { "2a37" } } },
                    Callback = function() end,
                }"#,
            )
        })
    };
    assert!(wait_for(|| link.subscribing.load(Ordering::SeqCst)));
    engine.reset().unwrap();

    let err = script.join().unwrap().unwrap_err();
    assert!(err.message.contains("reset"), "{err}");
    assert_eq!(api.dispatcher().active_count(), 0);
    api.dispatcher().join();
    assert_eq!(p.registration_count(), 0);
}

#[test]
fn subscribe_fault_is_raised_and_callback_released() {
    let p = peripheral();
    let link = SlowLink::new(p.clone(), Duration::ZERO, Duration::ZERO);
    let (engine, api) = bridge(link.clone());
    let callbacks = |engine: &ScriptEngine| {
        engine
            .run_exclusive(|rt| Ok(CallbackTable::len(rt.lua())))
            .unwrap()
    };

    link.broken.store(true, Ordering::SeqCst);
    run(
        &engine,
        r#"
        ok, err = pcall(blim.subscribe, {
            services = { { service = "180d", chars = { "2a37" } } },
            Callback = function() end,
        })
        "#,
    )
    .unwrap();
    assert_eq!(engine.global("ok").unwrap(), json!(false));
    let err = engine.global_string("err").unwrap().unwrap();
    assert!(err.contains("subscribe() faulted in host code"), "{err}");
    assert_eq!(api.dispatcher().active_count(), 0);
    assert_eq!(callbacks(&engine), 1);

    // the parked callback goes with the next subscribe
    link.broken.store(false, Ordering::SeqCst);
    run(
        &engine,
        r#"blim.subscribe{
            services = { { service = "180d", chars = { "2a37" } } },
            Callback = function() end,
        }"#,
    )
    .unwrap();
    assert_eq!(api.dispatcher().active_count(), 1);
    assert_eq!(callbacks(&engine), 1);
}

// --- exclusivity ---

#[test]
fn concurrent_access_is_serialized() {
    let (engine, _) = bridge(peripheral());
    run(&engine, "counter = 0").unwrap();
    let inside = Arc::new(AtomicBool::new(false));

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let engine = engine.clone();
            let inside = Arc::clone(&inside);
            thread::spawn(move || {
                for _ in 0..50 {
                    engine
                        .run_exclusive(|rt| {
                            assert!(!inside.swap(true, Ordering::SeqCst), "overlapping access");
                            let result = rt
                                .lua()
                                .load("counter = counter + 1")
                                .exec()
                                .map_err(|e| ScriptError::from_lua(&e, "counter"));
                            inside.store(false, Ordering::SeqCst);
                            result
                        })
                        .unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(engine.global_integer("counter").unwrap(), Some(400));
}

#[test]
fn notifications_from_host_threads_do_not_block() {
    let p = peripheral();
    let (engine, _) = bridge(p.clone());
    run(
        &engine,
        r#"blim.subscribe{
            services = { { service = "180d", chars = { "2a37" } } },
            Callback = function() end,
        }"#,
    )
    .unwrap();

    // Holding the engine must not stall the device thread.
    engine
        .run_exclusive(|_| {
            let started = Instant::now();
            for v in 0..=255u8 {
                p.notify("180d", "2a37", &[v]);
            }
            assert!(started.elapsed() < Duration::from_millis(500));
            Ok(())
        })
        .unwrap();
}
