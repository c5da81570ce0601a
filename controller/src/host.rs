use std::{
    collections::HashMap,
    future::IntoFuture,
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, LastWill, MqttOptions, QoS};
use serde::Serialize;
use tokio::{
    net::TcpListener,
    sync::{mpsc, watch},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

use heating_common::{
    execute, ActuatorEngine, Authority, CloudToken, ControllerStatus, EngineAction, GpioError,
    GpioSink, InputConfig, LinkPhase, LocalSample, OutputConfig, PulseQueue, RemoteCommand,
    RuntimeConfig, StatusLed, TOPIC_CMD_INTENSITY, TOPIC_STATE, TOPIC_STATE_INTENSITY, TOPIC_STATUS,
};

// Clockwise order of (pin_a, pin_b).
const GRAY_SEQUENCE: [(bool, bool); 4] = [(false, false), (true, false), (true, true), (false, true)];

#[derive(Clone)]
struct AppState {
    remote_tx: mpsc::UnboundedSender<RemoteCommand>,
    status: watch::Receiver<ControllerStatus>,
    knob: Arc<watch::Sender<i32>>,
}

struct AppStore {
    runtime_path: PathBuf,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct Accepted {
    queued: i64,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut runtime);

    let mut engine =
        ActuatorEngine::new(runtime.control.clone()).context("invalid control configuration")?;
    info!(
        "engine ready: {} input, {} output, range {}..={}",
        engine.config().input.kind(),
        engine.config().output.kind(),
        engine.config().min_value,
        engine.config().max_value
    );

    let mqtt_options = build_mqtt_options(&runtime);
    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);

    let mut gpio = SimulatedGpio::new(&engine.config().output);
    execute_engine_actions(&engine.startup(), &mut gpio, &mqtt)
        .context("failed to drive initial output")?;

    let (remote_tx, remote_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(engine.status());
    let (knob_tx, knob_rx) = watch::channel(initial_knob_target(&engine.config().input));
    let mqtt_connected = Arc::new(AtomicBool::new(false));

    spawn_mqtt_loop(
        mqtt.clone(),
        eventloop,
        remote_tx.clone(),
        mqtt_connected.clone(),
    );
    spawn_heartbeat_loop(
        mqtt.clone(),
        status_rx.clone(),
        engine.config().heartbeat_period_ms,
        mqtt_connected,
    );
    let control = spawn_control_loop(engine, gpio, mqtt, remote_rx, status_tx, knob_rx);

    let app_state = AppState {
        remote_tx,
        status: status_rx,
        knob: Arc::new(knob_tx),
    };

    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/intensity", post(handle_set_intensity))
        .route("/api/knob", post(handle_set_knob))
        .with_state(app_state);

    let port = std::env::var("HEATING_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    tokio::select! {
        result = axum::serve(listener, app).into_future() => result.context("http server stopped")?,
        result = control => result.context("control loop aborted")??,
    }
    Ok(())
}

fn apply_env_overrides(runtime: &mut RuntimeConfig) {
    if let Ok(host) = std::env::var("MQTT_HOST") {
        runtime.network.mqtt_host = host;
    }
    if let Some(port) = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        runtime.network.mqtt_port = port;
    }
    if let Ok(user) = std::env::var("MQTT_USER") {
        runtime.network.mqtt_user = user;
    }
    if let Ok(token) = std::env::var("HEATING_TOKEN") {
        runtime.cloud.token = CloudToken::new(token);
    }
}

fn build_mqtt_options(runtime: &RuntimeConfig) -> MqttOptions {
    let network = &runtime.network;
    let mut options = MqttOptions::new(
        network.client_id.clone(),
        network.mqtt_host.clone(),
        network.mqtt_port,
    );
    options.set_keep_alive(Duration::from_secs(15));
    options.set_last_will(LastWill::new(
        TOPIC_STATUS,
        "offline",
        QoS::AtLeastOnce,
        true,
    ));
    if !network.mqtt_user.is_empty() {
        options.set_credentials(
            network.mqtt_user.clone(),
            runtime.cloud.token.expose().to_string(),
        );
    }
    options
}

fn spawn_mqtt_loop(
    mqtt: AsyncClient,
    mut eventloop: EventLoop,
    remote_tx: mpsc::UnboundedSender<RemoteCommand>,
    connected: Arc<AtomicBool>,
) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if message.topic != TOPIC_CMD_INTENSITY {
                        continue;
                    }
                    match RemoteCommand::from_payload(&message.payload) {
                        Some(command) => {
                            debug!("remote command {}", command.requested_value);
                            if remote_tx.send(command).is_err() {
                                warn!("control loop is gone; dropping remote command");
                            }
                        }
                        None => warn!(
                            "ignoring malformed intensity payload ({} bytes)",
                            message.payload.len()
                        ),
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    connected.store(true, Ordering::Relaxed);
                    info!("mqtt connected");
                    if let Err(err) = mqtt.try_subscribe(TOPIC_CMD_INTENSITY, QoS::AtLeastOnce) {
                        warn!("mqtt subscribe failed: {err}");
                    }
                    if let Err(err) = mqtt.try_publish(TOPIC_STATUS, QoS::AtLeastOnce, true, "online")
                    {
                        warn!("online status publish failed: {err}");
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    connected.store(false, Ordering::Relaxed);
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

fn spawn_heartbeat_loop(
    mqtt: AsyncClient,
    status: watch::Receiver<ControllerStatus>,
    period_ms: u64,
    connected: Arc<AtomicBool>,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(period_ms));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut led = StatusLed::new();

        loop {
            interval.tick().await;

            let phase = if connected.load(Ordering::Relaxed) {
                LinkPhase::Connected
            } else {
                LinkPhase::Provisioning
            };
            if let Some(lit) = led.update(phase, monotonic_ms()) {
                debug!("status led {}", if lit { "on" } else { "off" });
            }

            if phase != LinkPhase::Connected {
                continue;
            }

            let payload = serde_json::to_vec(&*status.borrow());
            match payload {
                Ok(body) => {
                    if let Err(err) = mqtt.publish(TOPIC_STATE, QoS::AtLeastOnce, true, body).await
                    {
                        warn!("controller state publish failed: {err}");
                    }
                }
                Err(err) => warn!("controller state serialization failed: {err}"),
            }
        }
    });
}

fn spawn_control_loop(
    mut engine: ActuatorEngine,
    mut gpio: SimulatedGpio,
    mqtt: AsyncClient,
    mut remote_rx: mpsc::UnboundedReceiver<RemoteCommand>,
    status_tx: watch::Sender<ControllerStatus>,
    knob_rx: watch::Receiver<i32>,
) -> JoinHandle<anyhow::Result<()>> {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_millis(engine.config().sample_period_ms));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut knob = SimulatedKnob::new(engine.config().input);

        loop {
            interval.tick().await;

            let mut pending = Vec::new();
            while let Ok(command) = remote_rx.try_recv() {
                pending.push(command);
            }
            let target = *knob_rx.borrow();
            let sample = knob.sample(target, engine.authority() == Authority::Remote);

            let actions = engine
                .run_cycle(pending, Some(sample))
                .context("sampler produced an unusable reading")?;
            if !actions.is_empty() {
                execute_engine_actions(&actions, &mut gpio, &mqtt)
                    .context("gpio fault, stopping control loop")?;
            }
            gpio.service_pulses(monotonic_ms())
                .context("relay pulse fault, stopping control loop")?;

            let next = engine.status();
            status_tx.send_if_modified(|current| {
                if *current == next {
                    return false;
                }
                *current = next;
                true
            });
        }
    })
}

fn execute_engine_actions(
    actions: &[EngineAction],
    gpio: &mut SimulatedGpio,
    mqtt: &AsyncClient,
) -> Result<(), GpioError> {
    for action in actions {
        match action {
            EngineAction::Output(command) => execute(gpio, std::slice::from_ref(command))?,
            EngineAction::Mirror(value) => {
                info!("intensity -> {value}");
                if let Err(err) =
                    mqtt.try_publish(TOPIC_STATE_INTENSITY, QoS::AtLeastOnce, true, value.to_string())
                {
                    warn!("intensity mirror publish failed: {err}");
                }
            }
        }
    }
    Ok(())
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.status.borrow().clone();
    Json(status)
}

async fn handle_set_intensity(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let Ok(requested) = value.trim().parse::<i64>() else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid intensity value");
    };

    if state.remote_tx.send(RemoteCommand::new(requested)).is_err() {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "Control loop is not running",
        );
    }

    (StatusCode::ACCEPTED, Json(Accepted { queued: requested })).into_response()
}

async fn handle_set_knob(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let Ok(target) = value.trim().parse::<i32>() else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid knob position");
    };

    state.knob.send_replace(target);
    (
        StatusCode::ACCEPTED,
        Json(Accepted {
            queued: i64::from(target),
        }),
    )
        .into_response()
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("HEATING_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.heating"));

        Self {
            runtime_path: data_dir.join("runtime.json"),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        match tokio::fs::read(&self.runtime_path).await {
            Ok(raw) => Ok(RuntimeConfig::from_json_slice(&raw)
                .with_context(|| format!("bad config in {}", self.runtime_path.display()))?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }
}

fn initial_knob_target(input: &InputConfig) -> i32 {
    match *input {
        InputConfig::Encoder { .. } => 0,
        InputConfig::Analog { raw_min, .. } => raw_min,
    }
}

/// Stand-in for the physical control on a desktop build.
///
/// Encoder mode walks the Gray sequence one edge per tick toward a detent
/// target. Analog mode reports the target, with one count of jitter while a
/// remote hold is in place to exercise the hysteresis band.
struct SimulatedKnob {
    input: InputConfig,
    position: i64,
    jitter_up: bool,
}

impl SimulatedKnob {
    fn new(input: InputConfig) -> Self {
        Self {
            input,
            position: 0,
            jitter_up: false,
        }
    }

    fn sample(&mut self, target: i32, remote_holds: bool) -> LocalSample {
        match self.input {
            InputConfig::Encoder { resolution, .. } => {
                let goal = i64::from(target) * i64::from(resolution.edges_per_step());
                self.position += (goal - self.position).signum();
                let (pin_a, pin_b) = GRAY_SEQUENCE[self.position.rem_euclid(4) as usize];
                LocalSample::Encoder { pin_a, pin_b }
            }
            InputConfig::Analog {
                raw_min, raw_max, ..
            } => {
                if !remote_holds {
                    return LocalSample::Analog(target.clamp(raw_min, raw_max));
                }
                self.jitter_up = !self.jitter_up;
                let jitter = if self.jitter_up { 1 } else { -1 };
                LocalSample::Analog(target.saturating_add(jitter).clamp(raw_min, raw_max))
            }
        }
    }
}

/// Output lines kept in memory and traced instead of wired to pins.
#[derive(Debug, Default)]
struct SimulatedGpio {
    lines: HashMap<i32, u32>,
    pulses: HashMap<i32, u64>,
    queue: PulseQueue,
}

impl SimulatedGpio {
    fn new(output: &OutputConfig) -> Self {
        let pins: Vec<i32> = match *output {
            OutputConfig::Discrete { pins } => pins.to_vec(),
            OutputConfig::Duty { pin } => vec![pin],
            OutputConfig::PulsedRelay {
                up_pin, down_pin, ..
            } => vec![up_pin, down_pin],
        };
        Self {
            lines: pins.into_iter().map(|pin| (pin, 0)).collect(),
            pulses: HashMap::new(),
            queue: PulseQueue::new(),
        }
    }

    fn line(&mut self, pin: i32) -> Result<&mut u32, GpioError> {
        self.lines.get_mut(&pin).ok_or(GpioError::UnknownPin(pin))
    }

    /// Plays out at most one queued pulse phase, counting rising edges.
    fn service_pulses(&mut self, now_ms: u64) -> Result<(), GpioError> {
        let Some(edge) = self.queue.poll(now_ms) else {
            return Ok(());
        };
        self.set_level(edge.pin, edge.high)?;
        if edge.high {
            *self.pulses.entry(edge.pin).or_default() += 1;
        }
        Ok(())
    }
}

impl GpioSink for SimulatedGpio {
    fn set_level(&mut self, pin: i32, high: bool) -> Result<(), GpioError> {
        *self.line(pin)? = u32::from(high);
        debug!("gpio {pin} -> {}", if high { "high" } else { "low" });
        Ok(())
    }

    fn set_duty(&mut self, pin: i32, duty: u32) -> Result<(), GpioError> {
        *self.line(pin)? = duty;
        debug!("gpio {pin} duty -> {duty}");
        Ok(())
    }

    fn pulse(&mut self, pin: i32, width_ms: u64) -> Result<(), GpioError> {
        self.line(pin)?;
        self.queue.push(pin, width_ms);
        debug!("gpio {pin} pulse {width_ms}ms queued");
        Ok(())
    }
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
