//! Offline installation tool: corpus ingestion, calibration computation,
//! and loop-mode rendering for verification.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use grainfield::analysis::{AnalysisConfig, MfccExtractor};
use grainfield::calibration::{calibration_filename, compute_calibration, save_calibration};
use grainfield::corpus::artifact::CorpusArtifact;
use grainfield::engine::{GrainMode, GrainTrigger, Scheduler, SynthesisEngine, render_grain};
use grainfield::ingest::{self, LoadedBuffer};

fn main() {
    if let Err(err) = grainfield::logging::init() {
        eprintln!("Logging unavailable: {err}");
    }
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("ingest") => cmd_ingest(&args[1..]),
        Some("calibrate") => cmd_calibrate(&args[1..]),
        Some("render") => cmd_render(&args[1..]),
        Some("--help") | Some("-h") | None => {
            print_usage();
            Ok(())
        }
        Some(other) => Err(format!("Unknown command {other:?}\n{USAGE}")),
    }
}

const USAGE: &str = "\
Usage:
  grainfield-tool ingest <input.wav>... [--out <dir>]
  grainfield-tool calibrate <reference.wav> [--out <dir>]
  grainfield-tool render <artifact.json> <source.wav> [--out <file.wav>]
                         [--seconds <n>] [--seed <n>]";

fn print_usage() {
    println!("{USAGE}");
}

fn cmd_ingest(args: &[String]) -> Result<(), String> {
    let (inputs, options) = split_options(args)?;
    if inputs.is_empty() {
        return Err(format!("ingest: no input files\n{USAGE}"));
    }
    let out_dir = options.out.unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&out_dir)
        .map_err(|err| format!("Cannot create {}: {err}", out_dir.display()))?;
    for input in inputs {
        let path = ingest::ingest_file(&input, &out_dir).map_err(|err| err.to_string())?;
        println!("{}", path.display());
    }
    Ok(())
}

fn cmd_calibrate(args: &[String]) -> Result<(), String> {
    let (inputs, options) = split_options(args)?;
    let [input] = inputs.as_slice() else {
        return Err(format!("calibrate: expected one reference file\n{USAGE}"));
    };
    let out_dir = options.out.unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&out_dir)
        .map_err(|err| format!("Cannot create {}: {err}", out_dir.display()))?;

    let buffer = ingest::load_wav_mono(input).map_err(|err| err.to_string())?;
    let extractor = MfccExtractor::new(AnalysisConfig::for_sample_rate(buffer.sample_rate))
        .map_err(|err| err.to_string())?;
    let stats = compute_calibration(&extractor, &buffer.samples);

    let now = time::OffsetDateTime::now_local()
        .unwrap_or_else(|_| time::OffsetDateTime::now_utc());
    let path = out_dir.join(calibration_filename(now));
    save_calibration(&path, &stats).map_err(|err| err.to_string())?;
    println!("{}", path.display());
    Ok(())
}

fn cmd_render(args: &[String]) -> Result<(), String> {
    let (inputs, options) = split_options(args)?;
    let [artifact_path, source_path] = inputs.as_slice() else {
        return Err(format!("render: expected <artifact.json> <source.wav>\n{USAGE}"));
    };
    let artifact = CorpusArtifact::load(artifact_path).map_err(|err| err.to_string())?;
    let index = artifact.build_index().map_err(|err| err.to_string())?;
    let buffer = ingest::load_wav_mono(source_path).map_err(|err| err.to_string())?;
    let seconds = options.seconds.unwrap_or(5.0);
    if !(seconds > 0.0) {
        return Err("render: --seconds must be positive".to_string());
    }

    let mut engine = SynthesisEngine::new(artifact.means.len());
    if let Some(seed) = options.seed {
        engine.seed_rng(seed);
    }
    engine.set_source(
        Arc::new(index),
        artifact.times.clone(),
        buffer.duration_seconds(),
    );
    engine.set_mode(GrainMode::Loop);
    engine.set_playing(true);

    let triggers = collect_loop_triggers(engine, seconds);
    let out_path = options
        .out
        .unwrap_or_else(|| PathBuf::from("grainfield-render.wav"));
    let rendered = render_to_buffer(&triggers, &buffer, seconds);
    write_wav(&out_path, &rendered, buffer.sample_rate)?;
    println!(
        "Rendered {} grains over {seconds}s -> {}",
        triggers.len(),
        out_path.display()
    );
    Ok(())
}

/// Drive the scheduler synthetically across the render span, collecting
/// every trigger the engine emits.
fn collect_loop_triggers(mut engine: SynthesisEngine, seconds: f64) -> Vec<GrainTrigger> {
    let collected = Arc::new(Mutex::new(Vec::new()));
    let mut scheduler = Scheduler::new();
    let sink = collected.clone();
    scheduler.add(0.0, move |now| {
        let tick = engine.tick(now);
        if let Some(trigger) = tick.trigger
            && let Ok(mut collected) = sink.lock()
        {
            collected.push(trigger);
        }
        (tick.next_time < seconds).then_some(tick.next_time)
    });
    scheduler.advance_to(seconds);
    drop(scheduler);
    Arc::try_unwrap(collected)
        .map(|mutex| mutex.into_inner().unwrap_or_default())
        .unwrap_or_default()
}

fn render_to_buffer(triggers: &[GrainTrigger], buffer: &LoadedBuffer, seconds: f64) -> Vec<f32> {
    let len = (seconds * buffer.sample_rate as f64) as usize;
    let mut out = vec![0.0_f32; len];
    for trigger in triggers {
        render_grain(&mut out, buffer.sample_rate, 0.0, trigger, &buffer.samples);
    }
    out
}

fn write_wav(path: &std::path::Path, samples: &[f32], sample_rate: u32) -> Result<(), String> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(path, spec)
        .map_err(|err| format!("Cannot write {}: {err}", path.display()))?;
    for &sample in samples {
        writer
            .write_sample(sample)
            .map_err(|err| format!("Cannot write {}: {err}", path.display()))?;
    }
    writer
        .finalize()
        .map_err(|err| format!("Cannot finalize {}: {err}", path.display()))
}

#[derive(Debug, Default)]
struct Options {
    out: Option<PathBuf>,
    seconds: Option<f64>,
    seed: Option<u64>,
}

fn split_options(args: &[String]) -> Result<(Vec<PathBuf>, Options), String> {
    let mut inputs = Vec::new();
    let mut options = Options::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--out" => {
                let value = iter.next().ok_or("--out requires a value")?;
                options.out = Some(PathBuf::from(value));
            }
            "--seconds" => {
                let value = iter.next().ok_or("--seconds requires a value")?;
                options.seconds =
                    Some(value.parse().map_err(|_| format!("Bad --seconds {value:?}"))?);
            }
            "--seed" => {
                let value = iter.next().ok_or("--seed requires a value")?;
                options.seed = Some(value.parse().map_err(|_| format!("Bad --seed {value:?}"))?);
            }
            other if other.starts_with("--") => {
                return Err(format!("Unknown option {other:?}\n{USAGE}"));
            }
            _ => inputs.push(PathBuf::from(arg)),
        }
    }
    Ok((inputs, options))
}
