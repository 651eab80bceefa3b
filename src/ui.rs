// src/ui.rs
use std::sync::Arc;

use egui::{Align, Color32, ColorImage, Layout, RichText, TextureHandle, TextureOptions, Vec2};
use log::{error, info, warn};

use crate::{
    camera::{CameraWidget, FacingMode},
    config::Config,
    controller::{AppPhase, Controller},
    convert::GeminiClient,
    data_url::DataUrl,
};

const IMAGE_BOX: f32 = 360.0;

/// Texture cached per data URL so we only decode once.
struct CachedImage {
    source: DataUrl,
    texture: TextureHandle,
}

pub struct AnimeCamUI {
    camera: CameraWidget,
    controller: Controller,
    captured_tex: Option<CachedImage>,
    processed_tex: Option<CachedImage>,
    status: Option<String>,
}

impl AnimeCamUI {
    pub fn new(cc: &eframe::CreationContext<'_>, config: Config) -> Self {
        info!("Initializing AnimeCamUI");
        let converter = Arc::new(GeminiClient::new(&config.gemini));
        let controller = Controller::new(converter, config.export.file_name.clone())
            .with_repaint(cc.egui_ctx.clone());

        let mut app = Self {
            camera: CameraWidget::new(cc.egui_ctx.clone(), config.camera),
            controller,
            captured_tex: None,
            processed_tex: None,
            status: None,
        };
        app.start_camera();
        app
    }

    fn start_camera(&mut self) {
        match self.camera.start() {
            Ok(()) => self.controller.clear_error(),
            Err(err) => self.controller.report_error(&err),
        }
    }

    fn capture(&mut self) {
        match self.camera.capture() {
            Ok(url) => {
                self.camera.stop();
                self.controller.on_capture(&url.to_string());
            }
            Err(err) => self.controller.report_error(&err),
        }
    }

    fn retake(&mut self) {
        self.controller.retake();
        self.captured_tex = None;
        self.processed_tex = None;
        self.status = None;
        self.start_camera();
    }

    fn download(&mut self) {
        if !self.controller.can_download() {
            return;
        }
        let Some(dir) = rfd::FileDialog::new()
            .set_title(format!("Save {} to...", self.controller.export_name()))
            .pick_folder()
        else {
            return;
        };
        self.status = match self.controller.download_into(&dir) {
            Ok(Some(path)) => Some(format!("Saved to {}", path.display())),
            Ok(None) => None,
            Err(e) => {
                error!("Download failed: {:#}", e);
                Some(format!("Could not save: {:#}", e))
            }
        };
    }

    fn camera_view(&mut self, ui: &mut egui::Ui) {
        let preview = self.camera.texture().filter(|_| self.camera.is_running()).cloned();
        match preview {
            Some(texture) => {
                let bounds = Vec2::new(ui.available_width(), IMAGE_BOX * 1.3);
                let size = fit(texture.size_vec2(), bounds);
                ui.add(egui::Image::new(&texture).fit_to_exact_size(size));
            }
            None if self.camera.is_running() => {
                ui.add_space(IMAGE_BOX / 3.0);
                ui.spinner();
                ui.label("Initializing camera...");
            }
            None => {
                ui.add_space(IMAGE_BOX / 3.0);
                if ui.button("Retry camera").clicked() {
                    self.start_camera();
                }
            }
        }

        ui.add_space(12.0);
        ui.horizontal(|ui| {
            let facing = match self.camera.facing() {
                FacingMode::User => "front",
                FacingMode::Environment => "back",
            };
            if ui.button(format!("🔄 Switch camera ({})", facing)).clicked() {
                match self.camera.flip() {
                    Ok(()) => self.controller.clear_error(),
                    Err(err) => {
                        warn!("Flip failed: {}", err);
                        self.controller.report_error(&err);
                    }
                }
            }
            let ready = self.camera.is_running() && self.camera.texture().is_some();
            if ui
                .add_enabled(ready, egui::Button::new(RichText::new("📷 Take photo").strong()))
                .clicked()
            {
                self.capture();
            }
        });
    }

    fn result_view(&mut self, ui: &mut egui::Ui, ctx: &egui::Context) {
        sync_texture(ctx, &mut self.captured_tex, self.controller.captured(), "captured");
        sync_texture(ctx, &mut self.processed_tex, self.controller.processed(), "processed");
        let processing = self.controller.phase() == AppPhase::Processing;

        ui.horizontal(|ui| {
            image_box(ui, self.captured_tex.as_ref(), "Original photo", false);
            image_box(ui, self.processed_tex.as_ref(), "Anime character", processing);
        });

        if self.controller.phase() == AppPhase::Result {
            ui.add_space(12.0);
            ui.horizontal(|ui| {
                if ui.button("Take a new photo").clicked() {
                    self.retake();
                }
                if ui
                    .add_enabled(self.controller.can_download(), egui::Button::new("⬇ Download"))
                    .clicked()
                {
                    self.download();
                }
            });
        }
    }
}

fn fit(size: Vec2, bounds: Vec2) -> Vec2 {
    if size.x <= 0.0 || size.y <= 0.0 {
        return bounds;
    }
    size * (bounds.x / size.x).min(bounds.y / size.y)
}

fn sync_texture(
    ctx: &egui::Context,
    slot: &mut Option<CachedImage>,
    source: Option<&DataUrl>,
    name: &str,
) {
    let Some(source) = source else {
        *slot = None;
        return;
    };
    if slot.as_ref().is_some_and(|c| &c.source == source) {
        return;
    }
    *slot = match source.to_image() {
        Ok(image) => {
            let rgba = image.to_rgba8();
            let size = [rgba.width() as usize, rgba.height() as usize];
            let color_image = ColorImage::from_rgba_unmultiplied(size, rgba.as_raw());
            Some(CachedImage {
                source: source.clone(),
                texture: ctx.load_texture(name, color_image, TextureOptions::LINEAR),
            })
        }
        Err(e) => {
            error!("Failed to decode {} image: {:#}", name, e);
            None
        }
    };
}

fn image_box(ui: &mut egui::Ui, image: Option<&CachedImage>, title: &str, loading: bool) {
    let (rect, _) = ui.allocate_exact_size(Vec2::splat(IMAGE_BOX), egui::Sense::hover());
    ui.painter().rect_filled(rect, 8.0, Color32::from_gray(32));
    let mut child = ui.new_child(
        egui::UiBuilder::new()
            .max_rect(rect)
            .layout(Layout::centered_and_justified(egui::Direction::TopDown)),
    );
    if loading {
        child.spinner();
    } else if let Some(cached) = image {
        let size = fit(cached.texture.size_vec2(), rect.size());
        child.add(egui::Image::new(&cached.texture).fit_to_exact_size(size));
    } else {
        child.label(RichText::new(title).color(Color32::GRAY));
    }
}

impl eframe::App for AnimeCamUI {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        if let Some(err) = self.camera.poll() {
            self.controller.report_error(&err);
        }
        self.controller.poll();

        egui::TopBottomPanel::top("top_panel").show(ctx, |ui| {
            egui::menu::bar(ui, |ui| {
                ui.menu_button("File", |ui| {
                    if ui.button("Quit").clicked() {
                        ctx.send_viewport_cmd(egui::ViewportCommand::Close);
                    }
                });
                ui.add_space(16.0);
                egui::widgets::global_theme_preference_buttons(ui);
            });
        });

        egui::TopBottomPanel::bottom("bottom_panel").resizable(false).show(ctx, |ui| {
            ui.with_layout(Layout::right_to_left(Align::Center), |ui| {
                ui.label(RichText::new("Powered by Gemini 2.5 Flash Image").small().weak());
                if let Some(status) = &self.status {
                    ui.label(status);
                }
            });
        });

        egui::CentralPanel::default().show(ctx, |ui| {
            ui.with_layout(Layout::top_down(Align::Center), |ui| {
                ui.heading("Anime Character Creator");
                ui.label("Turn yourself into an anime character with AI!");
                ui.separator();

                match self.controller.phase() {
                    AppPhase::Capturing => self.camera_view(ui),
                    AppPhase::Processing | AppPhase::Result => self.result_view(ui, ctx),
                }

                if let Some(err) = self.controller.error() {
                    ui.add_space(8.0);
                    ui.colored_label(Color32::RED, format!("Error! {}", err));
                }
            });
        });
    }

    fn on_exit(&mut self, _gl: Option<&eframe::glow::Context>) {
        info!("Exit requested. Releasing camera...");
        self.camera.stop();
    }
}
