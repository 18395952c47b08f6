use clap::Parser;
use rand::Rng;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde::Serialize;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Publishes synthetic battery, solar and charger telemetry over MQTT.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// MQTT Broker Host
    #[arg(long, default_value = "localhost")]
    host: String,

    /// MQTT Broker Port
    #[arg(long, default_value_t = 1883)]
    port: u16,

    /// Topic prefix before `sites/...`
    #[arg(long, default_value = "ecogrid")]
    prefix: String,

    /// Number of simulated sites
    #[arg(long, default_value_t = 1)]
    sites: u32,

    /// Devices of each type (storage, solar, charger) per site
    #[arg(long, default_value_t = 2)]
    devices_per_type: u32,

    /// Messages per second (total throughput target)
    #[arg(long, default_value_t = 10)]
    rate: u64,

    /// Duration of test in seconds (0 for infinite)
    #[arg(long, default_value_t = 60)]
    duration: u64,

    /// Fraction of messages sent with an out-of-range value, to exercise the DLQ
    #[arg(long, default_value_t = 0.0)]
    invalid_ratio: f64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StoragePayload {
    timestamp: String,
    soc: f64,
    remaining_capacity: f64,
    nominal_capacity: f64,
    charge_rate: f64,
    voltage: f64,
    temperature: f64,
    health_status: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SolarPayload {
    timestamp: String,
    current_output: f64,
    energy_yield: f64,
    panel_temperature: f64,
    irradiance: f64,
    inverter_efficiency: f64,
    inverter_status: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChargerPayload {
    timestamp: String,
    active_sessions: u32,
    power_delivered: f64,
    energy_delivered: f64,
    revenue: f64,
    utilization_rate: f64,
    network_connectivity: bool,
    payment_system_status: &'static str,
    faults: u32,
}

const KINDS: [(&str, &str); 3] = [("bms", "BMS"), ("solar", "PV"), ("ev", "EV")];

fn payload(kind: &str, rng: &mut impl Rng, invalid: bool) -> serde_json::Result<Vec<u8>> {
    let timestamp = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default();
    match kind {
        "bms" => {
            let nominal = 500.0;
            let soc: f64 = if invalid { 140.0 } else { rng.gen_range(5.0..100.0) };
            serde_json::to_vec(&StoragePayload {
                timestamp,
                soc,
                remaining_capacity: nominal * soc.min(100.0) / 100.0,
                nominal_capacity: nominal,
                charge_rate: rng.gen_range(-50.0..50.0),
                voltage: rng.gen_range(740.0..820.0),
                temperature: rng.gen_range(20.0..52.0),
                health_status: "GOOD",
            })
        }
        "solar" => serde_json::to_vec(&SolarPayload {
            timestamp,
            current_output: if invalid { -10.0 } else { rng.gen_range(0.0..250.0) },
            energy_yield: rng.gen_range(0.0..1500.0),
            panel_temperature: rng.gen_range(15.0..80.0),
            irradiance: rng.gen_range(0.0..1000.0),
            inverter_efficiency: rng.gen_range(90.0..99.0),
            inverter_status: if rng.gen_bool(0.02) { "FAULT" } else { "NORMAL" },
        }),
        _ => {
            let active_sessions = rng.gen_range(0..4);
            serde_json::to_vec(&ChargerPayload {
                timestamp,
                active_sessions,
                power_delivered: active_sessions as f64 * rng.gen_range(7.0..50.0),
                energy_delivered: rng.gen_range(0.0..400.0),
                revenue: rng.gen_range(0.0..300.0),
                utilization_rate: if invalid { 180.0 } else { rng.gen_range(0.0..100.0) },
                network_connectivity: true,
                payment_system_status: if rng.gen_bool(0.02) { "OFFLINE" } else { "ONLINE" },
                faults: 0,
            })
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    anyhow::ensure!(args.rate > 0, "--rate must be positive");
    anyhow::ensure!(args.sites > 0 && args.devices_per_type > 0, "--sites and --devices-per-type must be positive");
    println!("Starting Load Tester with config: {:?}", args);

    let client_id = format!("load_tester_{}", uuid::Uuid::new_v4());
    let mut mqttoptions = MqttOptions::new(client_id, &args.host, args.port);
    mqttoptions.set_keep_alive(Duration::from_secs(5));
    mqttoptions.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 100);

    // Drain the event loop in the background so publishes make progress.
    tokio::spawn(async move { while eventloop.poll().await.is_ok() {} });

    let start_time = std::time::Instant::now();
    let mut interval = tokio::time::interval(Duration::from_micros(1_000_000 / args.rate));
    let devices_per_site = args.devices_per_type as u64 * KINDS.len() as u64;
    let total_devices = args.sites as u64 * devices_per_site;
    let mut total_sent: u64 = 0;
    let mut rng = rand::thread_rng();

    loop {
        interval.tick().await;

        if args.duration > 0 && start_time.elapsed().as_secs() >= args.duration {
            println!("Configured duration {}s elapsed. Stopping.", args.duration);
            break;
        }

        // Round-robin over every device of every site
        let index = total_sent % total_devices;
        let site = index / devices_per_site + 1;
        let within = index % devices_per_site;
        let (kind, prefix) = KINDS[(within / args.devices_per_type as u64) as usize];
        let device_no = within % args.devices_per_type as u64 + 1;

        let device_id = format!("{}-SITE{}-{:03}", prefix, site, device_no);
        let topic = format!("{}/sites/{}/devices/{}/telemetry/{}", args.prefix, site, device_id, kind);
        let invalid = args.invalid_ratio > 0.0 && rng.gen_bool(args.invalid_ratio.min(1.0));
        let body = payload(kind, &mut rng, invalid)?;

        if let Err(e) = client.publish(&topic, QoS::AtLeastOnce, false, body).await {
            eprintln!("Failed to publish: {:?}", e);
        }

        total_sent += 1;
        if total_sent % args.rate == 0 {
            println!("Sent {} messages...", total_sent);
        }
    }

    println!("Load Test Complete. Total messages sent: {}", total_sent);
    Ok(())
}
