//! Integration tests for the preamp controller
//!
//! These tests drive the controller through real collaborators where that is
//! possible without hardware: the thread scheduler, the BruteFIR client over
//! loopback TCP and the sysfs GPIO provider over a temporary directory.

use phire_core::domain::config::{ConfigManager, OutputConfig, PreampConfig};
use phire_core::domain::controller::PreampController;
use phire_core::domain::error::PreampError;
use phire_core::domain::preamp::{FilterEngine, Preamp};
use phire_core::domain::scheduler::Scheduler;
use phire_core::domain::sim::{ManualScheduler, RecordingFilterEngine, SimulatedGpio};
use phire_infra::{BruteFir, SysfsGpio, ThreadScheduler};
use std::collections::{BTreeMap, BTreeSet};
use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn test_config() -> PreampConfig {
    let mut config = PreampConfig::default();
    config.timing.settle_ms = 0;
    config.timing.debounce_ms = 0;
    config.amplifier.on_delay_ms = 0;
    config.amplifier.off_grace_ms = 50;
    config.outputs = vec![
        OutputConfig::new("speakers", &[0, 1], &["harman", "dirac"], true),
        OutputConfig::new("no_sub", &[0], &["harman_without_sub"], true),
        OutputConfig::new("headphones", &[2], &["hd650"], false),
        OutputConfig::new("off", &[], &["dirac"], false),
    ];
    config
}

fn simulated(config: &PreampConfig, scheduler: Arc<dyn Scheduler>) -> (SimulatedGpio, PreampController) {
    let gpio = SimulatedGpio::new();
    let engine: Arc<dyn FilterEngine> = Arc::new(RecordingFilterEngine::new());
    let preamp = PreampController::new(config, &gpio, engine, scheduler).unwrap();
    (gpio, preamp)
}

// ============================================================================
// DEFERRED AMPLIFIER POWER
// ============================================================================

#[test]
fn test_amplifier_grace_period_with_thread_scheduler() {
    let scheduler = Arc::new(ThreadScheduler::new().unwrap());
    let (gpio, preamp) = simulated(&test_config(), scheduler);

    preamp.set_output("speakers:harman").unwrap();
    assert!(gpio.level("TRIG_OUT_0"));

    preamp.set_output("headphones:hd650").unwrap();
    assert!(gpio.level("TRIG_OUT_0"));
    assert!(preamp.amplifier_off_pending());

    thread::sleep(Duration::from_millis(300));
    assert!(!gpio.level("TRIG_OUT_0"));
    assert!(!preamp.amplifier_off_pending());
}

#[test]
fn test_quick_toggle_keeps_amplifier_on() {
    let scheduler = Arc::new(ThreadScheduler::new().unwrap());
    let mut config = test_config();
    config.amplifier.off_grace_ms = 150;
    let (gpio, preamp) = simulated(&config, scheduler);

    preamp.set_output("speakers:harman").unwrap();
    for _ in 0..5 {
        preamp.set_output("headphones:hd650").unwrap();
        preamp.set_output("no_sub:harman_without_sub").unwrap();
    }

    thread::sleep(Duration::from_millis(400));
    assert!(gpio.level("TRIG_OUT_0"));
    assert_eq!(preamp.physical_outputs(), BTreeSet::from([0]));
}

// ============================================================================
// CONCURRENCY
// ============================================================================

#[test]
fn test_concurrent_callers_never_interleave_sequences() {
    let scheduler: Arc<dyn Scheduler> = Arc::new(ManualScheduler::new());
    let (gpio, preamp) = simulated(&test_config(), scheduler);
    let preamp = Arc::new(preamp);
    gpio.clear_journal();

    let workers: Vec<_> = (0..6)
        .map(|worker| {
            let preamp = Arc::clone(&preamp);
            thread::spawn(move || {
                for step in 0..25 {
                    let result = match (worker + step) % 5 {
                        0 => preamp.adjust_volume(37).map(|_| ()),
                        1 => preamp.adjust_volume(-23).map(|_| ()),
                        2 => preamp.set_output("speakers:harman"),
                        3 => preamp.set_output("headphones:hd650"),
                        _ => preamp.toggle_mute().map(|_| ()),
                    };
                    result.unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    // every power-rail bracket holds one board's relays and is closed before
    // the next one opens
    let mut open: Option<String> = None;
    for (line, value) in gpio.journal() {
        if line == "RELAY_PWR" {
            if value {
                assert!(open.is_none(), "power rail raised twice");
                open = Some(String::new());
            } else {
                assert!(open.take().is_some(), "power rail dropped while idle");
            }
        } else if let Some(board) = open.as_mut() {
            let prefix = if line.starts_with("DELTA1_") { "DELTA1_" } else { "DELTA2_" };
            if board.is_empty() {
                *board = prefix.to_string();
            }
            assert_eq!(board, prefix, "sequence mixed relay boards");
        }
    }
    assert!(open.is_none());

    // latched relays agree with every cache
    let volume = preamp.get_volume();
    for bit in 0..8 {
        assert_eq!(gpio.latched("DELTA1_", bit), Some(volume & (1 << bit) != 0));
    }
    let physical = preamp.physical_outputs();
    for (position, relay) in [5, 6, 7].into_iter().enumerate() {
        assert_eq!(gpio.latched("DELTA2_", relay), Some(physical.contains(&position)));
    }

    let expected = if preamp.muted() {
        BTreeSet::new()
    } else if preamp.get_output().as_deref() == Some("speakers:harman") {
        BTreeSet::from([0, 1])
    } else {
        BTreeSet::from([2])
    };
    assert_eq!(physical, expected);
}

// ============================================================================
// BRUTEFIR
// ============================================================================

fn engine_server(reply: &'static str) -> (u16, thread::JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut request = String::new();
        reader.read_line(&mut request).unwrap();

        let mut stream = stream;
        stream.write_all(reply.as_bytes()).unwrap();
        request
    });
    (port, handle)
}

fn brutefir(port: u16) -> BruteFir {
    BruteFir::new(
        "127.0.0.1",
        port,
        vec!["left".to_string(), "right".to_string()],
        Duration::from_secs(2),
    )
}

#[test]
fn test_brutefir_accepts_coefficients() {
    let (port, server) = engine_server("");
    brutefir(port).change_filter_coefficients("harman").unwrap();

    let request = server.join().unwrap();
    assert_eq!(
        request,
        "cfc \"left\" \"harman\"; cfc \"right\" \"harman\"; quit;\n"
    );
}

#[test]
fn test_brutefir_rejection_is_engine_error() {
    let (port, server) = engine_server("Unknown coefficient set \"nope\".\n");
    let err = brutefir(port).change_filter_coefficients("nope").unwrap_err();
    assert!(matches!(err, PreampError::ExternalEngine(_)));
    server.join().unwrap();
}

#[test]
fn test_unreachable_engine_leaves_relays_untouched() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let gpio = SimulatedGpio::new();
    let engine: Arc<dyn FilterEngine> = Arc::new(brutefir(port));
    let scheduler: Arc<dyn Scheduler> = Arc::new(ManualScheduler::new());
    let preamp = PreampController::new(&test_config(), &gpio, engine, scheduler).unwrap();
    gpio.clear_journal();

    let err = preamp.set_output("speakers:harman").unwrap_err();
    assert!(matches!(err, PreampError::ExternalEngine(_)));
    assert!(gpio.journal().is_empty());
    assert_eq!(preamp.get_output(), None);
}

// ============================================================================
// SYSFS GPIO
// ============================================================================

fn sysfs_tree(config: &PreampConfig) -> (tempfile::TempDir, BTreeMap<String, u32>) {
    let temp = tempfile::TempDir::new().unwrap();
    let mut names = vec![
        config.attenuator.power_line.clone(),
        config.amplifier.line.clone(),
    ];
    for bit in 0..8 {
        names.push(format!("{}SET_{}", config.attenuator.prefix, bit));
        names.push(format!("{}RST_{}", config.attenuator.prefix, bit));
    }
    for relay in config.matrix.inputs.iter().chain(&config.matrix.outputs) {
        names.push(format!("{}SET_{}", config.matrix.prefix, relay));
        names.push(format!("{}RST_{}", config.matrix.prefix, relay));
    }

    let mut lines = BTreeMap::new();
    for (number, name) in names.into_iter().enumerate() {
        let number = number as u32 + 100;
        let dir = temp.path().join(format!("gpio{}", number));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("value"), "0").unwrap();
        lines.insert(name, number);
    }
    (temp, lines)
}

#[test]
fn test_controller_over_sysfs_lines() {
    let config = test_config();
    let (temp, lines) = sysfs_tree(&config);
    let value = |name: &str| {
        let path = temp.path().join(format!("gpio{}/value", lines[name]));
        std::fs::read_to_string(path).unwrap()
    };

    let gpio = SysfsGpio::new(temp.path(), lines.clone());
    let engine = Arc::new(RecordingFilterEngine::new());
    let scheduler: Arc<dyn Scheduler> = Arc::new(ManualScheduler::new());
    let preamp = PreampController::new(&config, &gpio, engine.clone(), scheduler).unwrap();

    preamp.turn_on().unwrap();
    preamp.set_output("speakers:harman").unwrap();

    assert_eq!(value("TRIG_OUT_0"), "1");
    assert_eq!(value("RELAY_PWR"), "0");
    assert_eq!(preamp.get_volume(), 170);
    assert_eq!(engine.applied(), vec!["dirac", "harman"]);
    assert!(preamp.amplifier_powered().unwrap());
}

// ============================================================================
// CONFIGURATION
// ============================================================================

#[tokio::test]
async fn test_factory_config_drives_controller() {
    let temp = tempfile::TempDir::new().unwrap();
    let manager = ConfigManager::new(temp.path().to_path_buf());

    let mut config = manager.load().await.unwrap();
    assert!(manager.config_path().exists());
    config.timing.settle_ms = 0;
    config.timing.debounce_ms = 0;
    config.amplifier.on_delay_ms = 0;

    let scheduler: Arc<dyn Scheduler> = Arc::new(ManualScheduler::new());
    let (gpio, preamp) = simulated(&config, scheduler);

    let outputs = preamp.get_outputs();
    assert!(outputs.contains(&"speakers:harman_with_sub_dec7".to_string()));
    assert!(outputs.contains(&"headphones:hd650".to_string()));

    preamp.turn_on().unwrap();
    preamp.set_output("headphones:hd650").unwrap();
    assert_eq!(preamp.physical_outputs(), BTreeSet::from([2]));
    assert_eq!(gpio.latched("DELTA2_", 7), Some(true));
    assert!(!gpio.level("TRIG_OUT_0"));
}
