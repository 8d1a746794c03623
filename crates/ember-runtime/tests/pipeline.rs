//! End-to-end runs of the tick pipeline against simulated inputs, a scripted
//! model, and simulated actuators.

use std::sync::Arc;
use std::time::Duration;

use ember_hal::sim::{CommandLog, ScriptedInput, SimRegistry};
use ember_hal::{BackoffConfig, InputPlugin, InputRunner};
use ember_kernel::{ActionParser, HaltInterlock, SafetyVerifier};
use ember_middleware::{EventBus, Topic};
use ember_perception::{Fuser, ObservationTable, SourcePolicy};
use ember_runtime::{
    ActionRouter, AgentConfig, AgentLoop, EventBusSink, InferenceGateway, LoopTiming, RetryConfig,
    ScriptedEndpoint,
};
use ember_types::{
    AbortReason, ControlCommand, DispatchStatus, Event, EventPayload, ImageFrame, LaserScan,
    ObservationPayload, ParamValue, RejectReason, SnapshotState, TickOutcome, TickRecord,
};
use tokio::sync::watch;
use tokio::time::{Instant, sleep};

const CONFIG: &str = r#"
name = "rover"
persona = "You are a small indoor rover. Be brief."

[[plugins]]
id = "speaker"
kind = "sim"

[[plugins]]
id = "base"
kind = "sim"

[[actions]]
name = "speak"
description = "Say a sentence out loud"
target = "speaker"
params = [{ name = "text", kind = { type = "string", max_len = 200 } }]

[[actions]]
name = "move"
description = "Drive with a body-frame velocity"
target = "base"
params = [
  { name = "x", kind = { type = "number", min = -1.0, max = 1.0 } },
  { name = "theta", kind = { type = "number", min = -3.2, max = 3.2 }, required = false },
]

[[actions]]
name = "stop"
description = "Stop the base"
target = "base"
idempotent = true

[[safety.param_limits]]
action = "move"
param = "x"
max_abs = 0.5
"#;

struct Rig {
    agent: AgentLoop,
    table: Arc<ObservationTable>,
    endpoint: Arc<ScriptedEndpoint>,
    log: CommandLog,
    bus: Arc<EventBus>,
}

fn rig(endpoint: ScriptedEndpoint, timing: LoopTiming, sources: &[(&str, bool)]) -> Rig {
    let config = AgentConfig::from_toml(CONFIG).unwrap();
    config.validate().unwrap();
    let vocabulary = Arc::new(config.vocabulary().unwrap());

    let table = Arc::new(ObservationTable::new());
    let mut fuser = Fuser::new(
        Arc::clone(&table),
        Arc::from(config.persona.as_str()),
        Arc::clone(&vocabulary),
    );
    for (id, required) in sources {
        let policy = if *required {
            SourcePolicy::required()
        } else {
            SourcePolicy::optional()
        };
        fuser = fuser.with_source(*id, policy.max_age(Duration::from_millis(400)));
    }

    let halt = HaltInterlock::new();
    let mut verifier = SafetyVerifier::new();
    for limit in &config.safety.param_limits {
        verifier.add_rule(Box::new(limit.clone()));
    }
    verifier.add_rule(Box::new(halt.clone()));
    let parser = ActionParser::new(vocabulary, Arc::new(verifier));

    let (registry, log) = SimRegistry::new().with_speaker().with_drive_base().build();
    let router = ActionRouter::new(registry, Duration::from_millis(200), 2);

    let endpoint = Arc::new(endpoint);
    let gateway = InferenceGateway::new(endpoint.clone(), RetryConfig::default());

    let bus = Arc::new(EventBus::default());
    let agent = AgentLoop::new(fuser, gateway, parser, router, timing)
        .with_halt(halt)
        .with_control(bus.subscribe_to(Topic::Control))
        .with_telemetry(Arc::new(EventBusSink::new(Arc::clone(&bus))));

    Rig {
        agent,
        table,
        endpoint,
        log,
        bus,
    }
}

fn timing() -> LoopTiming {
    LoopTiming {
        interval: Duration::from_millis(300),
        deadline: Duration::from_millis(1000),
        inference_timeout: Duration::from_millis(500),
    }
}

fn runner(plugin: impl InputPlugin + 'static, table: &Arc<ObservationTable>) -> InputRunner {
    let mut runner = InputRunner::new(
        Box::new(plugin),
        table.clone(),
        BackoffConfig {
            base: Duration::from_millis(100),
            max: Duration::from_secs(1),
        },
    );
    runner.start().unwrap();
    runner
}

fn text(s: &str) -> ObservationPayload {
    ObservationPayload::Text { text: s.into() }
}

fn source<'a>(record: &'a TickRecord, id: &str) -> &'a ember_types::SourceSummary {
    record.sources.iter().find(|s| s.source_id == id).unwrap()
}

#[tokio::test(start_paused = true)]
async fn speak_reply_dispatches_exactly_one_command() {
    let mut rig = rig(ScriptedEndpoint::replying(r#"speak("hello")"#), timing(), &[("mic", true)]);
    let mut mic = runner(
        ScriptedInput::new("mic", Duration::from_millis(100), vec![text("a person says hi")]),
        &rig.table,
    );
    sleep(Duration::from_millis(10)).await;

    let record = rig.agent.tick().await;
    assert!(record.is_committed());
    assert_eq!(record.dispatch.len(), 1);
    assert_eq!(record.dispatch[0].status, DispatchStatus::Succeeded);

    let log = rig.log.lock().unwrap();
    assert_eq!(log.len(), 1);
    let (plugin, command) = &log[0];
    assert_eq!(plugin, "speaker");
    assert_eq!(command.action_name, "speak");
    assert_eq!(command.parameters["text"], ParamValue::String("hello".into()));
    drop(log);
    mic.stop().await;
}

#[tokio::test(start_paused = true)]
async fn unknown_action_is_rejected_and_the_rest_dispatched() {
    let reply = "jump()\nspeak(\"hi\")";
    let mut rig = rig(ScriptedEndpoint::replying(reply), timing(), &[]);

    let record = rig.agent.tick().await;
    assert!(record.is_committed());
    assert_eq!(record.candidates, 2);
    assert_eq!(record.commands.len(), 1);
    assert_eq!(record.commands[0].action_name, "speak");
    assert_eq!(record.dispatch.len(), 1);
    assert_eq!(record.rejections.len(), 1);
    assert_eq!(record.rejections[0].candidate_index, 0);
    assert!(matches!(record.rejections[0].reason, RejectReason::UnknownAction(ref n) if n == "jump"));
}

#[tokio::test(start_paused = true)]
async fn safety_limits_and_parameter_checks_reject_before_dispatch() {
    let reply = "move(x=0.9)\nmove(x=\"fast\")\nmove(x=0.3, theta=0.1)\nstop()";
    let mut rig = rig(ScriptedEndpoint::replying(reply), timing(), &[]);

    let record = rig.agent.tick().await;
    assert_eq!(record.candidates, 4);
    assert_eq!(record.rejections.len(), 2);
    assert!(matches!(record.rejections[0].reason, RejectReason::SafetyRule { .. }));
    assert_eq!(
        record.commands.iter().map(|c| c.action_name.as_str()).collect::<Vec<_>>(),
        ["move", "stop"]
    );
    // Same target, so the two commands ran in reply order.
    let log = rig.log.lock().unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].1.action_name, "move");
    assert_eq!(log[1].1.action_name, "stop");
}

#[tokio::test(start_paused = true)]
async fn ticks_read_the_latest_of_sources_at_different_rates() {
    let mut rig = rig(
        ScriptedEndpoint::replying("none()"),
        timing(),
        &[("front_camera", true), ("lidar", true)],
    );
    let frame = ObservationPayload::Image(ImageFrame {
        width: 640,
        height: 480,
        encoding: "rgb8".into(),
        description: Some("a hallway".into()),
        data: Vec::new(),
    });
    let mut camera = runner(
        ScriptedInput::new("front_camera", Duration::from_millis(200), vec![frame]),
        &rig.table,
    );
    let scan = ObservationPayload::Scan(LaserScan {
        ranges: vec![1.5, 0.8, 2.0],
        angle_min_rad: -0.5,
        angle_increment_rad: 0.5,
        range_max_m: 10.0,
    });
    let mut lidar = runner(
        ScriptedInput::new("lidar", Duration::from_millis(500), vec![scan]),
        &rig.table,
    );

    // Tick at t=300: camera captured at 0 and 200, lidar at 0.
    sleep(Duration::from_millis(300)).await;
    let before = Instant::now();
    let first = rig.agent.tick().await;
    assert_eq!(Instant::now(), before, "a tick never waits for an input");
    assert_eq!(rig.table.latest("front_camera").unwrap().sequence, 2);
    assert_eq!(source(&first, "front_camera").age_ms, Some(100));
    assert_eq!(source(&first, "lidar").age_ms, Some(300));
    assert!(first.sources.iter().all(|s| s.state == SnapshotState::Present));

    // Tick at t=600: camera at 400, lidar at 500.
    sleep(Duration::from_millis(300)).await;
    let second = rig.agent.tick().await;
    assert_eq!(source(&second, "front_camera").age_ms, Some(200));
    assert_eq!(source(&second, "lidar").age_ms, Some(100));
    assert_eq!(rig.table.latest("lidar").unwrap().sequence, 2);

    // Both snapshots reached the model.
    let prompts = rig.endpoint.prompts();
    assert_eq!(prompts.len(), 2);
    assert!(prompts[0][1].content.contains("a hallway"));

    camera.stop().await;
    lidar.stop().await;
}

#[tokio::test(start_paused = true)]
async fn an_offline_input_never_blocks_the_others() {
    let mut rig = rig(
        ScriptedEndpoint::replying(r#"speak("ok")"#),
        timing(),
        &[("mic", true), ("gps", false)],
    );
    let mut mic = runner(
        ScriptedInput::new("mic", Duration::from_millis(100), vec![text("hello robot")]),
        &rig.table,
    );
    let mut gps = runner(ScriptedInput::offline("gps"), &rig.table);
    sleep(Duration::from_millis(250)).await;

    let record = rig.agent.tick().await;
    assert!(record.is_committed());
    assert_eq!(source(&record, "mic").state, SnapshotState::Present);
    let gps_summary = source(&record, "gps");
    assert_eq!(gps_summary.state, SnapshotState::Missing);
    assert!(gps_summary.health.is_degraded());
    assert_eq!(record.dispatch.len(), 1);

    mic.stop().await;
    gps.stop().await;
}

#[tokio::test(start_paused = true)]
async fn inference_timeouts_abort_every_tick_on_schedule() {
    let slow = ScriptedEndpoint::replying(r#"speak("too late")"#).with_latency(Duration::from_secs(5));
    let mut rig = rig(slow, timing(), &[]);
    let mut telemetry = rig.bus.subscribe_to(Topic::Telemetry);

    let (tx, rx) = watch::channel(false);
    let stopper = tokio::spawn(async move {
        sleep(Duration::from_millis(1900)).await;
        tx.send(true).unwrap();
    });
    let started = Instant::now();
    let ticks = rig.agent.run(rx).await;
    stopper.await.unwrap();

    // Each tick is cut at the 500ms inference timeout; ticks start at
    // 0, 500, 1000, 1500 and the last one finishes before shutdown returns.
    assert_eq!(ticks, 4);
    assert_eq!(started.elapsed(), Duration::from_millis(2000));
    assert!(rig.log.lock().unwrap().is_empty());

    let records: Vec<TickRecord> = telemetry
        .drain()
        .into_iter()
        .filter_map(|e| match e.payload {
            EventPayload::Tick(r) => Some(*r),
            _ => None,
        })
        .collect();
    assert_eq!(records.len(), 4);
    for record in &records {
        assert_eq!(
            record.outcome,
            TickOutcome::Aborted {
                reason: AbortReason::InferenceTimeout
            }
        );
        assert!(record.dispatch.is_empty());
        assert!(record.latencies.total <= Duration::from_millis(1000));
    }
    assert_eq!(
        records.iter().map(|r| r.tick_id).collect::<Vec<_>>(),
        [1, 2, 3, 4]
    );
}

#[tokio::test(start_paused = true)]
async fn emergency_stop_on_the_bus_halts_dispatch() {
    let mut rig = rig(ScriptedEndpoint::replying("stop()"), timing(), &[]);
    assert!(rig.agent.tick().await.is_committed());

    rig.bus
        .publish_to(
            Topic::Control,
            Event::new("operator", EventPayload::Control(ControlCommand::EmergencyStop)),
        )
        .unwrap();
    let halted = rig.agent.tick().await;
    assert!(matches!(halted.outcome, TickOutcome::Skipped { .. }));
    assert!(rig.agent.is_halted());
    assert_eq!(rig.endpoint.calls(), 1);

    rig.bus
        .publish_to(
            Topic::Control,
            Event::new("operator", EventPayload::Control(ControlCommand::ReleaseStop)),
        )
        .unwrap();
    assert!(rig.agent.tick().await.is_committed());
    assert_eq!(rig.log.lock().unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn results_never_exceed_commands_or_candidates() {
    let replies = [
        "",
        "none()",
        "I am not sure what to do.",
        r#"speak("a") speak("b")"#,
        r#"{"actions":[{"name":"speak","args":{"text":"json"}},{"name":"fly","args":{}}]}"#,
        "move(x=2.0)",
        "move(x=0.1, theta=0.2, extra=1)",
        r#"speak("unterminated"#,
        "stop() stop() stop()",
    ];
    let endpoint = ScriptedEndpoint::new(replies.iter().map(|r| Ok(r.to_string())));
    let mut rig = rig(endpoint, timing(), &[]);

    for _ in replies {
        let record = rig.agent.tick().await;
        assert!(record.is_committed());
        assert!(record.dispatch.len() <= record.commands.len());
        assert!(record.commands.len() <= record.candidates);
        assert_eq!(record.commands.len() + record.rejections.len(), record.candidates);
        assert!(record.dispatch.iter().all(|r| r.tick_id == record.tick_id));
    }
}
