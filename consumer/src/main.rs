use edgewatch_common::channel::FrameChannel;
use edgewatch_common::config::Config;
use edgewatch_consumer::pipeline::AnalysisLoop;
use edgewatch_consumer::recognition::{check_tesseract_available, TesseractCli};
use edgewatch_consumer::render::GraphOptions;
use edgewatch_consumer::view;
use edgewatch_producer::{run_capture, source_from_config, CapturePolicy};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    info!(
        capture_mode = ?config.capture.mode,
        fps = config.capture.fps,
        window_size = config.analysis.window_size,
        region_mode = ?config.region.mode,
        region_every = config.analysis.region_every_n_frames,
        recognition = config.recognition.enabled,
        "starting edgewatch"
    );

    let source = match source_from_config(&config.capture) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to open capture source: {e}");
            std::process::exit(1);
        }
    };

    let channel = Arc::new(FrameChannel::new(config.channel.capacity));
    let (stop_tx, stop_rx) = watch::channel(false);
    let stop_tx = Arc::new(stop_tx);

    let capture = tokio::spawn(run_capture(
        source,
        Arc::clone(&channel),
        stop_rx.clone(),
        CapturePolicy::from_config(&config.capture),
    ));

    let mut analysis = AnalysisLoop::new(&config, Arc::clone(&channel));
    if config.recognition.enabled {
        check_tesseract_available(&config.recognition.command).await;
        analysis = analysis.with_recognizer(Arc::new(TesseractCli::new(&config.recognition)));
    }

    let (report_tx, report_rx) = watch::channel(None);

    if config.view.enabled {
        let bind = config.view.bind.clone();
        let graph = GraphOptions {
            width: config.view.graph_width,
            height: config.view.graph_height,
        };
        let stop = stop_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = view::serve(&bind, report_rx, graph, stop).await {
                error!(error = %e, "view server stopped");
            }
        });
    }

    // Ctrl-C requests a drain; the loop notices at its next tick.
    let signal_tx = Arc::clone(&stop_tx);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            let _ = signal_tx.send(true);
        }
    });

    info!("entering analysis loop");
    let result = analysis.run(stop_rx, report_tx).await;

    // Whatever ended the loop, stop capture and the view too.
    let _ = stop_tx.send(true);
    match capture.await {
        Ok(Ok(frames)) => info!(frames, "capture task finished"),
        Ok(Err(e)) => warn!(error = %e, "capture task ended with error"),
        Err(e) => error!(error = %e, "capture task panicked"),
    }

    match result {
        Ok(analysed) => info!(analysed, "edgewatch stopped"),
        Err(e) => {
            error!(error = %e, "edgewatch stopped on error");
            std::process::exit(1);
        }
    }
}
