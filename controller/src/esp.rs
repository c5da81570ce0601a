use core::convert::TryInto;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Mutex, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    adc::{
        attenuation::DB_11,
        oneshot::{config::AdcChannelConfig, AdcChannelDriver, AdcDriver},
        ADC1,
    },
    gpio::{AnyIOPin, Gpio34, Input, Output, PinDriver, Pull},
    ledc::{config::TimerConfig, LedcDriver, LedcTimerDriver, Resolution, LEDC},
    units::Hertz,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{gpio::AnyOutputPin, modem::Modem, prelude::Peripherals},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, LwtConfiguration, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    wifi::{BlockingWifi, EspWifi},
};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use heating_common::{
    execute, ActuatorEngine, CloudToken, EngineAction, GpioError, GpioSink, InputConfig,
    LinkPhase, LocalSample, NetworkConfig, OutputConfig, PulseQueue, RemoteCommand, RuntimeConfig,
    StatusLed, PROVISIONING_TIMEOUT_SEC, TOPIC_CMD_INTENSITY, TOPIC_STATE, TOPIC_STATE_INTENSITY,
    TOPIC_STATUS,
};

const NVS_NAMESPACE: &str = "heating";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const MAX_HTTP_BODY: usize = 2048;
const PROVISIONING_AP_SSID: &str = "CentralHeatingAP";
const PROVISIONING_AP_PASSWORD: &str = "HeatingSetup";
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const PROVISIONING_TICK_MS: u64 = 100;
const STATUS_LED_PIN: i32 = 2;
// Only GPIO34 is wired to the ADC channel driver.
const ADC_PIN: i32 = 34;
const LEDC_FREQUENCY_HZ: u32 = 1_000;

const PROVISIONING_INDEX_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Heating Controller Setup</title>
  <style>
    body{font-family:Arial,sans-serif;max-width:640px;margin:2rem auto;padding:0 1rem}
    label{display:block;margin:.5rem 0 .2rem}input{width:100%;padding:.5rem;box-sizing:border-box}
    button{padding:.55rem .9rem;margin-top:.8rem}.err{color:#a00000}.ok{color:#106010}
  </style>
</head>
<body>
  <h1>Heating Controller Setup</h1>
  <label>WiFi SSID</label><input id="wifiSsid" type="text">
  <label>WiFi Password (leave blank to keep current)</label><input id="wifiPass" type="password">
  <label>MQTT Host</label><input id="mqttHost" type="text">
  <label>MQTT Port</label><input id="mqttPort" type="number" min="1" max="65535">
  <label>MQTT Username</label><input id="mqttUser" type="text">
  <label>Cloud Token (leave blank to keep current)</label><input id="token" type="password">
  <button id="save">Save and Restart</button>
  <div id="status"></div>
  <script>
    const q=(id)=>document.getElementById(id);
    async function api(path,opt){const r=await fetch(path,opt);let b={};try{b=await r.json();}catch(_){}if(!r.ok)throw new Error(b.error||('Request failed: '+r.status));return b;}
    api('/api/network').then((n)=>{q('wifiSsid').value=n.wifiSsid||'';q('mqttHost').value=n.mqttHost||'';q('mqttPort').value=n.mqttPort||1883;q('mqttUser').value=n.mqttUser||'';});
    q('save').addEventListener('click', async ()=>{
      try{
        await api('/api/network',{method:'PUT',headers:{'content-type':'application/json'},body:JSON.stringify({
          wifiSsid:q('wifiSsid').value.trim(),wifiPass:q('wifiPass').value||undefined,
          mqttHost:q('mqttHost').value.trim(),mqttPort:Number(q('mqttPort').value||1883),
          mqttUser:q('mqttUser').value.trim(),token:q('token').value||undefined})});
        q('status').className='ok';q('status').textContent='Saved, restarting...';
      }catch(err){q('status').className='err';q('status').textContent=err.message;}
    });
  </script>
</body>
</html>
"#;

enum WifiStartup {
    Connected(EspWifi<'static>),
    Provisioning(EspWifi<'static>),
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

/// Built-in LED. Active-low, so lit means driven low.
struct LedPin {
    pin: PinDriver<'static, AnyOutputPin, Output>,
    tracker: StatusLed,
}

#[derive(Debug, Serialize)]
struct NetworkConfigView {
    #[serde(rename = "wifiSsid")]
    wifi_ssid: String,
    #[serde(rename = "wifiPassSet")]
    wifi_pass_set: bool,
    #[serde(rename = "mqttHost")]
    mqtt_host: String,
    #[serde(rename = "mqttPort")]
    mqtt_port: u16,
    #[serde(rename = "mqttUser")]
    mqtt_user: String,
    #[serde(rename = "tokenSet")]
    token_set: bool,
}

#[derive(Debug, Deserialize)]
struct NetworkConfigUpdate {
    #[serde(rename = "wifiSsid")]
    wifi_ssid: String,
    #[serde(rename = "wifiPass", default)]
    wifi_pass: Option<String>,
    #[serde(rename = "mqttHost")]
    mqtt_host: String,
    #[serde(rename = "mqttPort")]
    mqtt_port: u16,
    #[serde(rename = "mqttUser")]
    mqtt_user: String,
    #[serde(default)]
    token: Option<String>,
}

/// Output lines claimed for the configured actuator mode.
struct EspGpio {
    lines: HashMap<i32, PinDriver<'static, AnyOutputPin, Output>>,
    duty: Option<(i32, LedcDriver<'static>)>,
    pulses: PulseQueue,
}

enum LocalInput {
    Encoder {
        pin_a: PinDriver<'static, AnyIOPin, Input>,
        pin_b: PinDriver<'static, AnyIOPin, Input>,
    },
    Analog(AdcChannelDriver<'static, Gpio34, AdcDriver<'static, ADC1>>),
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    ensure_wifi_defaults(&mut runtime);

    info!(
        "NVS config loaded: ssid=`{}`, mqtt=`{}:{}`, input={}, output={}",
        runtime.network.wifi_ssid,
        runtime.network.mqtt_host,
        runtime.network.mqtt_port,
        runtime.control.input.kind(),
        runtime.control.output.kind(),
    );

    let Peripherals {
        modem,
        pins,
        ledc,
        adc1,
        ..
    } = Peripherals::take()?;
    let mut status_led = init_status_led(STATUS_LED_PIN);

    let wifi = match connect_wifi(modem, sys_loop, nvs_partition, &runtime.network)
        .context("wifi startup failed")?
    {
        WifiStartup::Connected(wifi) => {
            info!("wifi connected");
            wifi
        }
        WifiStartup::Provisioning(wifi) => {
            warn!(
                "wifi station connection unavailable; starting provisioning AP `{}`",
                PROVISIONING_AP_SSID
            );
            let saving = Arc::new(AtomicBool::new(false));
            let server = create_provisioning_http_server(nvs_store, saving.clone())?;

            let _wifi = wifi;
            let _server = server;
            let entered_ms = monotonic_ms();
            loop {
                let phase = if saving.load(Ordering::Relaxed) {
                    LinkPhase::SavingConfig
                } else {
                    LinkPhase::Provisioning
                };
                let now_ms = monotonic_ms();
                if phase.restart_due(entered_ms, now_ms) {
                    warn!(
                        "no network saved within {}s; restarting to retry stored config",
                        PROVISIONING_TIMEOUT_SEC
                    );
                    unsafe { esp_idf_svc::sys::esp_restart() };
                }
                update_status_led(&mut status_led, phase, now_ms);
                thread::sleep(Duration::from_millis(PROVISIONING_TICK_MS));
            }
        }
    };
    update_status_led(&mut status_led, LinkPhase::Connected, monotonic_ms());

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    let mut engine =
        ActuatorEngine::new(runtime.control.clone()).context("invalid control configuration")?;
    let mut gpio =
        EspGpio::new(&engine.config().output, ledc).context("failed to claim output lines")?;
    let input = LocalInput::new(&engine.config().input, pins.gpio34, adc1)
        .context("failed to claim input lines")?;

    let (mqtt_client, mqtt_conn) = create_mqtt_client(&runtime)?;
    let mqtt_client = Arc::new(Mutex::new(mqtt_client));
    let mqtt_connected = Arc::new(AtomicBool::new(false));

    execute_engine_actions(&engine.startup(), &mut gpio, &mqtt_client)
        .context("failed to drive initial output")?;

    let (remote_tx, remote_rx) = mpsc::channel();
    spawn_mqtt_receiver(
        mqtt_conn,
        mqtt_client.clone(),
        remote_tx,
        mqtt_connected.clone(),
    );

    let control = thread::Builder::new()
        .name("control-loop".into())
        .stack_size(12 * 1024)
        .spawn(move || {
            run_control_loop(
                engine,
                gpio,
                input,
                remote_rx,
                mqtt_client,
                mqtt_connected,
                status_led,
            )
        })
        .context("failed to spawn control loop thread")?;

    // Keep the radio alive for the program lifetime.
    let _wifi = wifi;

    match control.join() {
        Ok(result) => result.context("control loop stopped"),
        Err(_) => Err(anyhow!("control loop panicked")),
    }
}

fn ensure_wifi_defaults(runtime: &mut RuntimeConfig) {
    if runtime.network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            runtime.network.wifi_ssid = ssid.to_string();
        }
    }

    if runtime.network.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            runtime.network.wifi_pass = pass.to_string();
        }
    }
}

/// Sampler and heartbeat share this thread, so a remote command and a local
/// sample are never applied concurrently.
fn run_control_loop(
    mut engine: ActuatorEngine,
    mut gpio: EspGpio,
    mut input: LocalInput,
    remote_rx: mpsc::Receiver<RemoteCommand>,
    mqtt: Arc<Mutex<EspMqttClient<'static>>>,
    mqtt_connected: Arc<AtomicBool>,
    mut status_led: Option<LedPin>,
) -> anyhow::Result<()> {
    if let Err(err) = add_current_task_to_watchdog() {
        warn!("failed to register control loop with watchdog: {err:#}");
    }

    let sample_period = Duration::from_millis(engine.config().sample_period_ms);
    let heartbeat_period_ms = engine.config().heartbeat_period_ms;
    let mut last_heartbeat_ms = 0_u64;

    loop {
        let started = Instant::now();
        feed_watchdog();

        let pending: Vec<RemoteCommand> = remote_rx.try_iter().collect();
        let sample = input.sample()?;
        let actions = engine
            .run_cycle(pending, Some(sample))
            .context("sampler produced an unusable reading")?;
        if !actions.is_empty() {
            execute_engine_actions(&actions, &mut gpio, &mqtt)
                .context("gpio fault, stopping control loop")?;
        }
        gpio.service_pulses(monotonic_ms())
            .context("relay pulse fault, stopping control loop")?;

        let now_ms = monotonic_ms();
        if now_ms.saturating_sub(last_heartbeat_ms) >= heartbeat_period_ms {
            last_heartbeat_ms = now_ms;
            let connected = mqtt_connected.load(Ordering::Relaxed);
            let phase = if connected {
                LinkPhase::Connected
            } else {
                LinkPhase::Provisioning
            };
            update_status_led(&mut status_led, phase, now_ms);

            if connected {
                if let Err(err) = publish_state(&engine, &mqtt) {
                    warn!("state publish failed: {err:#}");
                }
            }
        }

        if let Some(remaining) = sample_period.checked_sub(started.elapsed()) {
            thread::sleep(remaining);
        }
    }
}

fn execute_engine_actions(
    actions: &[EngineAction],
    gpio: &mut EspGpio,
    mqtt: &Arc<Mutex<EspMqttClient<'static>>>,
) -> Result<(), GpioError> {
    for action in actions {
        match action {
            EngineAction::Output(command) => execute(gpio, std::slice::from_ref(command))?,
            EngineAction::Mirror(value) => {
                info!("intensity -> {value}");
                let Ok(mut client) = mqtt.lock() else {
                    warn!("mqtt client lock poisoned; skipping mirror");
                    continue;
                };
                if let Err(err) = client.enqueue(
                    TOPIC_STATE_INTENSITY,
                    QoS::AtLeastOnce,
                    true,
                    value.to_string().as_bytes(),
                ) {
                    warn!("intensity mirror publish failed: {err:?}");
                }
            }
        }
    }
    Ok(())
}

fn publish_state(
    engine: &ActuatorEngine,
    mqtt: &Arc<Mutex<EspMqttClient<'static>>>,
) -> anyhow::Result<()> {
    let payload = serde_json::to_vec(&engine.status())?;
    let mut client = mqtt
        .lock()
        .map_err(|_| anyhow!("mqtt client lock poisoned"))?;
    client.enqueue(TOPIC_STATE, QoS::AtLeastOnce, true, &payload)?;
    Ok(())
}

impl EspGpio {
    fn new(output: &OutputConfig, ledc: LEDC) -> anyhow::Result<Self> {
        let mut gpio = Self {
            lines: HashMap::new(),
            duty: None,
            pulses: PulseQueue::new(),
        };

        match *output {
            OutputConfig::Discrete { pins } => {
                for pin in pins {
                    gpio.claim_line(pin)?;
                }
            }
            OutputConfig::PulsedRelay {
                up_pin, down_pin, ..
            } => {
                gpio.claim_line(up_pin)?;
                gpio.claim_line(down_pin)?;
            }
            OutputConfig::Duty { pin } => {
                let timer = LedcTimerDriver::new(
                    ledc.timer0,
                    &TimerConfig::new()
                        .frequency(Hertz(LEDC_FREQUENCY_HZ))
                        .resolution(Resolution::Bits10),
                )?;
                let driver =
                    LedcDriver::new(ledc.channel0, timer, unsafe { AnyOutputPin::new(pin) })?;
                info!(
                    "duty output on GPIO{pin}, max duty {}",
                    driver.get_max_duty()
                );
                gpio.duty = Some((pin, driver));
            }
        }

        Ok(gpio)
    }

    fn claim_line(&mut self, pin: i32) -> anyhow::Result<()> {
        let mut driver = unsafe { PinDriver::output(AnyOutputPin::new(pin)) }
            .with_context(|| format!("GPIO{pin} unavailable as output"))?;
        driver.set_low()?;
        self.lines.insert(pin, driver);
        Ok(())
    }

    fn line(
        &mut self,
        pin: i32,
    ) -> Result<&mut PinDriver<'static, AnyOutputPin, Output>, GpioError> {
        self.lines.get_mut(&pin).ok_or(GpioError::UnknownPin(pin))
    }

    /// Plays out at most one queued pulse phase. Called every sampler tick.
    fn service_pulses(&mut self, now_ms: u64) -> Result<(), GpioError> {
        match self.pulses.poll(now_ms) {
            Some(edge) => self.set_level(edge.pin, edge.high),
            None => Ok(()),
        }
    }
}

fn write_failed(pin: i32, err: impl core::fmt::Debug) -> GpioError {
    GpioError::WriteFailed {
        pin,
        reason: format!("{err:?}"),
    }
}

impl GpioSink for EspGpio {
    fn set_level(&mut self, pin: i32, high: bool) -> Result<(), GpioError> {
        let line = self.line(pin)?;
        let result = if high { line.set_high() } else { line.set_low() };
        result.map_err(|err| write_failed(pin, err))
    }

    fn set_duty(&mut self, pin: i32, duty: u32) -> Result<(), GpioError> {
        match self.duty.as_mut() {
            Some((duty_pin, driver)) if *duty_pin == pin => {
                let duty = duty.min(driver.get_max_duty());
                driver.set_duty(duty).map_err(|err| write_failed(pin, err))
            }
            _ => Err(GpioError::UnknownPin(pin)),
        }
    }

    fn pulse(&mut self, pin: i32, width_ms: u64) -> Result<(), GpioError> {
        self.line(pin)?;
        self.pulses.push(pin, width_ms);
        Ok(())
    }
}

impl LocalInput {
    fn new(input: &InputConfig, adc_pin: Gpio34, adc: ADC1) -> anyhow::Result<Self> {
        match *input {
            InputConfig::Encoder { pin_a, pin_b, .. } => Ok(Self::Encoder {
                pin_a: encoder_line(pin_a)?,
                pin_b: encoder_line(pin_b)?,
            }),
            InputConfig::Analog { pin, .. } => {
                if pin != ADC_PIN {
                    warn!("analog input configured on GPIO{pin}; sampling GPIO{ADC_PIN} instead");
                }
                let driver = AdcDriver::new(adc)?;
                let config = AdcChannelConfig {
                    attenuation: DB_11,
                    ..Default::default()
                };
                Ok(Self::Analog(AdcChannelDriver::new(driver, adc_pin, &config)?))
            }
        }
    }

    fn sample(&mut self) -> anyhow::Result<LocalSample> {
        match self {
            Self::Encoder { pin_a, pin_b } => Ok(LocalSample::Encoder {
                pin_a: pin_a.is_high(),
                pin_b: pin_b.is_high(),
            }),
            Self::Analog(channel) => {
                let raw = channel.read().context("adc read failed")?;
                // 12-bit reading scaled to the 10-bit range analog configs use.
                Ok(LocalSample::Analog(i32::from(raw >> 2)))
            }
        }
    }
}

fn encoder_line(pin: i32) -> anyhow::Result<PinDriver<'static, AnyIOPin, Input>> {
    let mut driver = unsafe { PinDriver::input(AnyIOPin::new(pin)) }
        .with_context(|| format!("GPIO{pin} unavailable as input"))?;
    driver.set_pull(Pull::Up)?;
    Ok(driver)
}

fn create_provisioning_http_server(
    nvs_store: NvsStore,
    saving: Arc<AtomicBool>,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 12 * 1024,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;

    for path in ["/", "/generate_204", "/hotspot-detect.html", "/ncsi.txt"] {
        server.fn_handler::<anyhow::Error, _>(path, Method::Get, move |req| {
            req.into_ok_response()?
                .write_all(PROVISIONING_INDEX_HTML.as_bytes())?;
            Ok(())
        })?;
    }

    {
        let nvs_store = nvs_store.clone();
        server.fn_handler("/api/network", Method::Get, move |req| {
            let runtime = nvs_store.load_runtime_config().unwrap_or_default();
            let payload = build_network_config_view(&runtime);
            write_json(req, &payload)
        })?;
    }

    server.fn_handler::<anyhow::Error, _>("/api/network", Method::Put, move |mut req| {
        let body = read_request_body(&mut req)?;
        let update: NetworkConfigUpdate =
            serde_json::from_slice(&body).context("invalid network payload")?;

        if let Err(message) = validate_network_update(&update) {
            return write_error(req, 400, message);
        }

        saving.store(true, Ordering::Relaxed);
        let runtime = apply_network_update(&nvs_store, update)?;
        thread::Builder::new()
            .name("prov-restart".into())
            .spawn(|| {
                thread::sleep(Duration::from_secs(3));
                unsafe { esp_idf_svc::sys::esp_restart() };
            })
            .context("failed to spawn restart thread")?;
        write_json(req, &build_network_config_view(&runtime))
    })?;

    Ok(server)
}

fn read_request_body(
    req: &mut esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_json<T: Serialize>(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    status_code: u16,
    message: &str,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(&serde_json::json!({ "error": message }))?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn validate_network_update(update: &NetworkConfigUpdate) -> Result<(), &'static str> {
    if update.wifi_ssid.trim().is_empty() || update.wifi_ssid.len() > 32 {
        return Err("wifiSsid must be 1-32 characters");
    }
    if update.wifi_pass.as_ref().is_some_and(|pass| pass.len() > 64) {
        return Err("wifiPass must be at most 64 characters");
    }
    if update.mqtt_host.trim().is_empty() {
        return Err("mqttHost is required");
    }
    if update.mqtt_port == 0 {
        return Err("mqttPort must be 1-65535");
    }
    Ok(())
}

fn apply_network_update(
    nvs_store: &NvsStore,
    update: NetworkConfigUpdate,
) -> anyhow::Result<RuntimeConfig> {
    let mut runtime = nvs_store.load_runtime_config().unwrap_or_default();
    runtime.network.wifi_ssid = update.wifi_ssid.trim().to_string();
    if let Some(pass) = update.wifi_pass {
        runtime.network.wifi_pass = pass;
    }
    runtime.network.mqtt_host = update.mqtt_host.trim().to_string();
    runtime.network.mqtt_port = update.mqtt_port;
    runtime.network.mqtt_user = update.mqtt_user.trim().to_string();
    if let Some(token) = update.token {
        runtime.cloud.token = CloudToken::new(token);
    }

    nvs_store.save_runtime_config(&runtime)?;
    info!("network settings saved for `{}`", runtime.network.wifi_ssid);
    Ok(runtime)
}

fn build_network_config_view(runtime: &RuntimeConfig) -> NetworkConfigView {
    let network = &runtime.network;
    NetworkConfigView {
        wifi_ssid: network.wifi_ssid.clone(),
        wifi_pass_set: !network.wifi_pass.is_empty(),
        mqtt_host: network.mqtt_host.clone(),
        mqtt_port: network.mqtt_port,
        mqtt_user: network.mqtt_user.clone(),
        token_set: !runtime.cloud.token.expose().is_empty(),
    }
}

fn has_station_credentials(network: &NetworkConfig) -> bool {
    !network.wifi_ssid.trim().is_empty()
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<WifiStartup> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    if !has_station_credentials(network) {
        warn!("wifi credentials missing; entering provisioning AP mode");
        start_provisioning_ap(&mut wifi)?;
        return Ok(WifiStartup::Provisioning(esp_wifi));
    }

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                last_err = None;
                break;
            }
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    match last_err {
        None => Ok(WifiStartup::Connected(esp_wifi)),
        Some(err) => {
            warn!("all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed; last error: {err:#}");
            let _ = wifi.disconnect();
            let _ = wifi.stop();
            start_provisioning_ap(&mut wifi)?;
            Ok(WifiStartup::Provisioning(esp_wifi))
        }
    }
}

fn start_provisioning_ap(wifi: &mut BlockingWifi<&mut EspWifi<'static>>) -> anyhow::Result<()> {
    wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
        ssid: PROVISIONING_AP_SSID
            .try_into()
            .map_err(|_| anyhow!("provisioning AP SSID too long"))?,
        password: PROVISIONING_AP_PASSWORD
            .try_into()
            .map_err(|_| anyhow!("provisioning AP password too long"))?,
        auth_method: AuthMethod::WPA2Personal,
        channel: 1,
        ..Default::default()
    }))?;
    wifi.start()?;
    wifi.wait_netif_up()?;
    info!("provisioning AP started on `{}`", PROVISIONING_AP_SSID);
    Ok(())
}

fn create_mqtt_client(
    runtime: &RuntimeConfig,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let network = &runtime.network;
    let url = format!("mqtt://{}:{}", network.mqtt_host, network.mqtt_port);
    let token = runtime.cloud.token.expose();

    let conf = MqttClientConfiguration {
        client_id: Some(network.client_id.as_str()),
        username: if network.mqtt_user.is_empty() {
            None
        } else {
            Some(network.mqtt_user.as_str())
        },
        password: if token.is_empty() { None } else { Some(token) },
        lwt: Some(LwtConfiguration {
            topic: TOPIC_STATUS,
            payload: b"offline",
            qos: QoS::AtLeastOnce,
            retain: true,
        }),
        ..Default::default()
    };

    Ok(EspMqttClient::new(url.as_str(), &conf)?)
}

fn on_mqtt_connected(mqtt: &Arc<Mutex<EspMqttClient<'static>>>) -> anyhow::Result<()> {
    let mut client = mqtt
        .lock()
        .map_err(|_| anyhow!("mqtt client lock poisoned"))?;
    client.subscribe(TOPIC_CMD_INTENSITY, QoS::AtLeastOnce)?;
    client.enqueue(TOPIC_STATUS, QoS::AtLeastOnce, true, b"online")?;
    Ok(())
}

fn spawn_mqtt_receiver(
    mut conn: EspMqttConnection,
    mqtt: Arc<Mutex<EspMqttClient<'static>>>,
    remote_tx: mpsc::Sender<RemoteCommand>,
    connected: Arc<AtomicBool>,
) {
    let spawned = thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(8 * 1024)
        .spawn(move || loop {
            match conn.next() {
                Ok(event) => match event.payload() {
                    EventPayload::Connected(_) => {
                        connected.store(true, Ordering::Relaxed);
                        info!("mqtt connected");
                        if let Err(err) = on_mqtt_connected(&mqtt) {
                            warn!("mqtt subscribe failed: {err:#}");
                        }
                    }
                    EventPayload::Disconnected => {
                        connected.store(false, Ordering::Relaxed);
                        warn!("mqtt disconnected");
                    }
                    EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details,
                        ..
                    } => {
                        if topic != TOPIC_CMD_INTENSITY || !matches!(details, Details::Complete) {
                            continue;
                        }
                        match RemoteCommand::from_payload(data) {
                            Some(command) => {
                                debug!("remote command {}", command.requested_value);
                                if remote_tx.send(command).is_err() {
                                    warn!("control loop is gone; stopping mqtt receiver");
                                    return;
                                }
                            }
                            None => warn!(
                                "ignoring malformed intensity payload ({} bytes)",
                                data.len()
                            ),
                        }
                    }
                    _ => {}
                },
                Err(err) => {
                    connected.store(false, Ordering::Relaxed);
                    warn!("mqtt receive loop error: {err:?}");
                    thread::sleep(Duration::from_secs(2));
                }
            }
        });

    if let Err(err) = spawned {
        error!("failed to spawn mqtt receiver thread: {err}");
    }
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow!("nvs lock poisoned"))?;
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 2048];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(RuntimeConfig::from_json_slice(value.as_bytes())?),
            None => Ok(RuntimeConfig::default()),
        }
    }

    fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow!("nvs lock poisoned"))?;
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let payload = serde_json::to_string(runtime)?;
        nvs.set_str(NVS_RUNTIME_KEY, &payload)?;
        Ok(())
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn init_status_led(pin: i32) -> Option<LedPin> {
    let driver = unsafe { PinDriver::output(AnyOutputPin::new(pin)) };
    match driver {
        Ok(mut pin) => {
            let _ = pin.set_high();
            Some(LedPin {
                pin,
                tracker: StatusLed::new(),
            })
        }
        Err(err) => {
            warn!("status LED unavailable on GPIO{pin}: {err}");
            None
        }
    }
}

fn update_status_led(status_led: &mut Option<LedPin>, phase: LinkPhase, now_ms: u64) {
    let Some(led) = status_led.as_mut() else {
        return;
    };
    let Some(lit) = led.tracker.update(phase, now_ms) else {
        return;
    };

    let result = if lit {
        led.pin.set_low()
    } else {
        led.pin.set_high()
    };
    if let Err(err) = result {
        warn!("failed to drive status LED: {err}");
    }
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
