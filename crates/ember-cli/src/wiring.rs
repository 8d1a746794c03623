//! Turns a validated [`AgentConfig`] into running components.
//!
//! Everything the loop needs is built here, once, before the first tick:
//! input runners (plus the rosbridge connections feeding them), action
//! plugins, the safety rules, and the [`AgentLoop`] itself.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use ember_hal::sim::{CommandLog, ScriptedInput, SimActionPlugin, SimBehavior, SimCamera};
use ember_hal::{
    ActionPlugin, Backoff, BackoffConfig, CameraInput, InputPlugin, InputRunner, PluginRegistry,
    channel_input,
};
use ember_kernel::{ActionParser, HaltInterlock, SafetyVerifier};
use ember_middleware::{
    BusSink, DdsEncoder, EventBus, FrameSink, RosDecode, RosMessage, RosbridgeEncoder,
    RosbridgeIngest, SerialLineEncoder, Topic, TransportPlugin, WebSocketJsonEncoder,
    WebSocketSink, WriterSink, ZenohEncoder,
};
use ember_perception::{Fuser, MissingPolicy, ObservationTable, SourcePolicy};
use ember_runtime::config::{
    InputConfig, InputSource, MissingMode, PluginConfig, RosMessageConfig, RosTopicKind,
    SinkConfig, TransportConfig,
};
use ember_runtime::{
    ActionRouter, AgentConfig, AgentLoop, EventBusSink, InferenceEndpoint, InferenceGateway,
    LlmDriver, LoopTiming, PromptBuilder, RetryConfig,
};
use ember_types::{EmberError, ObservationPayload};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// All long-lived parts of one agent.
pub struct Assembly {
    pub agent: AgentLoop,
    pub bus: Arc<EventBus>,
    pub table: Arc<ObservationTable>,
    pub halt: HaltInterlock,
    runners: Vec<InputRunner>,
    ingests: Vec<(String, RosbridgeIngest)>,
    ingest_tasks: Vec<JoinHandle<()>>,
    backoff: BackoffConfig,
    stop_inputs: watch::Sender<bool>,
}

impl Assembly {
    pub fn input_ids(&self) -> Vec<&str> {
        self.runners.iter().map(|r| r.source_id()).collect()
    }

    pub fn plugin_ids(&self) -> Vec<String> {
        self.agent.registry().ids().into_iter().map(String::from).collect()
    }

    /// Start every input runner and rosbridge connection.
    ///
    /// # Errors
    ///
    /// Propagates a runner that refuses to start.
    pub fn start_inputs(&mut self) -> Result<(), EmberError> {
        for runner in &mut self.runners {
            runner.start()?;
        }
        for (url, ingest) in self.ingests.drain(..) {
            let shutdown = self.stop_inputs.subscribe();
            let backoff = self.backoff;
            self.ingest_tasks
                .push(tokio::spawn(keep_connected(url, ingest, backoff, shutdown)));
        }
        Ok(())
    }

    /// Stop every input and wait for the tasks to finish.
    pub async fn stop_inputs(&mut self) {
        let _ = self.stop_inputs.send(true);
        for runner in &mut self.runners {
            runner.stop().await;
        }
        for task in self.ingest_tasks.drain(..) {
            let _ = task.await;
        }
    }
}

/// Build an agent that talks to the configured OpenAI-compatible endpoint.
///
/// # Errors
///
/// [`EmberError::Configuration`] for an invalid vocabulary, or any error
/// opening a serial device.
pub async fn assemble(config: &AgentConfig) -> Result<Assembly, EmberError> {
    let endpoint: Arc<dyn InferenceEndpoint> = Arc::new(LlmDriver::new(&config.inference));
    assemble_with(config, endpoint).await
}

/// Build an agent around an arbitrary inference endpoint.
pub async fn assemble_with(
    config: &AgentConfig,
    endpoint: Arc<dyn InferenceEndpoint>,
) -> Result<Assembly, EmberError> {
    let vocabulary = Arc::new(config.vocabulary()?);
    let bus = Arc::new(EventBus::new(config.telemetry.bus_capacity));
    let table = Arc::new(ObservationTable::new());
    let timing = &config.timing;
    let backoff = BackoffConfig {
        base: Duration::from_millis(timing.input_backoff_base_ms),
        max: Duration::from_millis(timing.input_backoff_max_ms),
    };

    // ── Inputs ────────────────────────────────────────────────────────────────
    let mut fuser = Fuser::new(
        Arc::clone(&table),
        Arc::from(config.persona.as_str()),
        Arc::clone(&vocabulary),
    )
    .with_missing_policy(match config.fusion.missing {
        MissingMode::Mark => MissingPolicy::MarkMissing,
        MissingMode::Wait => MissingPolicy::WaitFor {
            grace: Duration::from_millis(config.fusion.grace_ms),
        },
    });
    let mut runners = Vec::with_capacity(config.inputs.len());
    let mut ingests: BTreeMap<String, RosbridgeIngest> = BTreeMap::new();
    for input in &config.inputs {
        table.register(&input.id);
        fuser = fuser.with_source(input.id.clone(), source_policy(input));
        let plugin = build_input(input, &mut ingests);
        runners.push(InputRunner::new(plugin, table.clone(), backoff));
    }

    // ── Actuation ─────────────────────────────────────────────────────────────
    let log = CommandLog::default();
    let mut registry = PluginRegistry::new();
    for plugin in &config.plugins {
        registry.register(build_plugin(plugin, &bus, &log).await?);
    }

    let halt = HaltInterlock::new();
    let mut verifier = SafetyVerifier::new();
    for limit in &config.safety.param_limits {
        verifier.add_rule(Box::new(limit.clone()));
    }
    verifier.add_rule(Box::new(halt.clone()));
    info!(rules = ?verifier.rule_names(), "safety rules loaded");

    // ── Loop ──────────────────────────────────────────────────────────────────
    let gateway = InferenceGateway::new(
        endpoint,
        RetryConfig {
            max_retries: timing.inference_retries,
            base_delay: Duration::from_millis(timing.inference_backoff_ms),
            ..RetryConfig::default()
        },
    );
    let parser = ActionParser::new(vocabulary, Arc::new(verifier));
    let router = ActionRouter::new(registry, timing.dispatch_timeout(), timing.dispatch_attempts);
    let agent = AgentLoop::new(fuser, gateway, parser, router, LoopTiming::from(timing))
        .with_prompt_builder(PromptBuilder::new(&config.prompt))
        .with_halt(halt.clone())
        .with_control(bus.subscribe_to(Topic::Control))
        .with_telemetry(Arc::new(EventBusSink::new(Arc::clone(&bus))));

    let (stop_inputs, _) = watch::channel(false);
    Ok(Assembly {
        agent,
        bus,
        table,
        halt,
        runners,
        ingests: ingests.into_iter().collect(),
        ingest_tasks: Vec::new(),
        backoff,
        stop_inputs,
    })
}

fn source_policy(input: &InputConfig) -> SourcePolicy {
    let policy = if input.required {
        SourcePolicy::required()
    } else {
        SourcePolicy::optional()
    };
    match input.max_age_ms {
        Some(ms) => policy.max_age(Duration::from_millis(ms)),
        None => policy,
    }
}

fn build_input(
    input: &InputConfig,
    ingests: &mut BTreeMap<String, RosbridgeIngest>,
) -> Box<dyn InputPlugin> {
    let interval = Duration::from_millis(input.min_interval_ms);
    match &input.source {
        InputSource::Scripted { texts } => Box::new(ScriptedInput::new(
            input.id.clone(),
            interval,
            texts
                .iter()
                .map(|t| ObservationPayload::Text { text: t.clone() })
                .collect(),
        )),
        InputSource::SimCamera { description } => Box::new(CameraInput::new(
            Box::new(SimCamera::new(input.id.clone(), description.clone())),
            interval,
        )),
        InputSource::Rosbridge { url, topic, decode } => {
            let (feed, plugin) = channel_input(input.id.clone(), interval);
            let decode = match decode {
                RosTopicKind::Scan => RosDecode::LaserScan,
                RosTopicKind::Text => RosDecode::Text,
                RosTopicKind::Structured => RosDecode::Structured,
            };
            let ingest = ingests.remove(url).unwrap_or_default();
            ingests.insert(url.clone(), ingest.subscribe(topic.clone(), decode, feed));
            Box::new(plugin)
        }
    }
}

async fn build_plugin(
    plugin: &PluginConfig,
    bus: &Arc<EventBus>,
    log: &CommandLog,
) -> Result<Arc<dyn ActionPlugin>, EmberError> {
    let id = plugin.id.clone();
    let transport = |encoder: Box<dyn ember_middleware::CommandEncoder>,
                     sink: Box<dyn FrameSink>| {
        let built = TransportPlugin::new(id.clone(), encoder, sink);
        let built = if plugin.actions.is_empty() {
            built
        } else {
            built.with_actions(plugin.actions.iter().cloned())
        };
        Arc::new(built) as Arc<dyn ActionPlugin>
    };

    let built = match &plugin.transport {
        TransportConfig::Sim { latency_ms, fail } => {
            let behavior = match fail {
                Some(detail) => SimBehavior::Fail(detail.clone()),
                None => SimBehavior::Succeed {
                    latency: Duration::from_millis(*latency_ms),
                },
            };
            let mut sim = SimActionPlugin::new(id.clone(), log.clone()).with_behavior(behavior);
            if !plugin.actions.is_empty() {
                let actions: Vec<&str> = plugin.actions.iter().map(String::as_str).collect();
                sim = sim.supporting(&actions);
            }
            Arc::new(sim) as Arc<dyn ActionPlugin>
        }
        TransportConfig::Rosbridge { url, routes } => {
            let encoder = routes.iter().fold(RosbridgeEncoder::new(), |enc, r| {
                enc.route(r.action.clone(), r.topic.clone(), ros_message(&r.message))
            });
            transport(Box::new(encoder), Box::new(WebSocketSink::new(url.clone())))
        }
        TransportConfig::Zenoh { key_prefix, sink } => transport(
            Box::new(ZenohEncoder::new(key_prefix.clone())),
            frame_sink(sink, &id, bus),
        ),
        TransportConfig::Dds { topic_prefix, sink } => transport(
            Box::new(DdsEncoder::new(topic_prefix.clone())),
            frame_sink(sink, &id, bus),
        ),
        TransportConfig::Serial { device } => transport(
            Box::new(SerialLineEncoder),
            Box::new(WriterSink::open_device(device).await?),
        ),
        TransportConfig::Websocket { url } => transport(
            Box::new(WebSocketJsonEncoder),
            Box::new(WebSocketSink::new(url.clone())),
        ),
    };
    info!(plugin = %plugin.id, "action plugin registered");
    Ok(built)
}

fn ros_message(config: &RosMessageConfig) -> RosMessage {
    match config {
        RosMessageConfig::Twist {
            linear_x,
            linear_y,
            angular_z,
        } => RosMessage::Twist {
            linear_x: linear_x.clone(),
            linear_y: linear_y.clone(),
            angular_z: angular_z.clone(),
        },
        RosMessageConfig::Text { param } => RosMessage::Text {
            param: param.clone(),
        },
        RosMessageConfig::Params => RosMessage::Params,
    }
}

fn frame_sink(config: &SinkConfig, plugin_id: &str, bus: &Arc<EventBus>) -> Box<dyn FrameSink> {
    match config {
        SinkConfig::Bus => Box::new(BusSink::new(plugin_id, Arc::clone(bus))),
        SinkConfig::Websocket { url } => Box::new(WebSocketSink::new(url.clone())),
    }
}

/// Keep one rosbridge connection alive, reconnecting with backoff, until
/// `shutdown` flips.
async fn keep_connected(
    url: String,
    ingest: RosbridgeIngest,
    backoff: BackoffConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new(backoff);
    loop {
        match ingest.run(&url, shutdown.clone()).await {
            Ok(()) if *shutdown.borrow() => break,
            Ok(()) => {
                info!(url, "rosbridge closed the connection");
                backoff.reset();
            }
            Err(e) => warn!(url, error = %e, failures = backoff.failures() + 1, "rosbridge ingest failed"),
        }
        let delay = backoff.next_delay();
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
