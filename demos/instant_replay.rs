use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use replaycap_rs::{
    pipeline::builder::ReplayBuilder,
    types::{config::QualityPreset, error::Result},
};

fn main() -> Result<()> {
    simple_logging::log_to_stderr(log::LevelFilter::Debug);
    log::info!("Instant Replay Example");
    log::info!("======================");
    log::info!("This example keeps the last 30 seconds of your screen in RAM.");
    log::info!("Press Enter to save a clip, Ctrl-C to quit.");
    log::info!("");

    let running = Arc::new(AtomicBool::new(true));
    let running_ctrlc = Arc::clone(&running);
    ctrlc::set_handler(move || {
        running_ctrlc.store(false, Ordering::Release);
    })
    .expect("Error setting Ctrl-C handler");

    let replay = ReplayBuilder::new()
        .with_duration_secs(30)
        .with_fps(60)
        .with_quality_preset(QualityPreset::Medium)
        .with_audio()
        .with_cursor_shown()
        .build()?;

    let mut clip_index = 0u32;
    let stdin = std::io::stdin();
    while running.load(Ordering::Acquire) {
        let mut line = String::new();
        if stdin.read_line(&mut line).is_err() {
            break;
        }
        if !running.load(Ordering::Acquire) {
            break;
        }

        clip_index += 1;
        let filename = format!("replay-{clip_index:03}.mp4");
        log::info!("Saving the replay window to {filename}");
        match replay.save(&filename) {
            Ok(()) => {
                let status = replay.status();
                log::info!(
                    "Saved. Buffer currently holds {} frames ({} MiB).",
                    status.frames_buffered,
                    status.memory_bytes / (1024 * 1024)
                );
            }
            Err(e) => log::warn!("Save failed: {e}"),
        }

        std::thread::sleep(Duration::from_millis(100));
    }

    log::info!("Stopping replay pipeline");
    replay.stop()?;
    Ok(())
}
