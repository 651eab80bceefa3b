// src/main.rs
#![warn(clippy::all, rust_2018_idioms)]
#![cfg_attr(not(debug_assertions), windows_subsystem = "windows")]

mod camera;
mod config;
mod controller;
mod convert;
mod data_url;
mod error;
mod ui;

#[cfg(not(target_arch = "wasm32"))]
fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::info!("Starting anime_cam");

    let config = config::Config::load()?;
    log::info!(
        "Model {} at {}, camera {}x{}@{} ({:?})",
        config.gemini.model,
        config.gemini.endpoint,
        config.camera.width,
        config.camera.height,
        config.camera.fps,
        config.camera.facing
    );

    let native_options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([900.0, 720.0])
            .with_min_inner_size([400.0, 300.0]),
        ..Default::default()
    };

    eframe::run_native(
        "Anime Character Creator",
        native_options,
        Box::new(|cc| Ok(Box::new(ui::AnimeCamUI::new(cc, config)))),
    )
    .map_err(|e| anyhow::anyhow!("Failed to start window: {}", e))
}
