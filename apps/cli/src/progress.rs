//! Progress bars for the tasks of a running job

use crate::output::{format_eta, format_speed};
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use modelfetch_types::{CoreEvent, DownloadTask, TaskStatus};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

const TEMPLATE: &str =
    "{spinner:.green} {wide_msg} [{bar:30.cyan/blue}] {bytes}/{total_bytes} {prefix}";

/// One bar per task, updated from core events
pub struct JobProgressView {
    multi: MultiProgress,
    bars: Arc<RwLock<HashMap<Uuid, (String, ProgressBar)>>>,
}

impl JobProgressView {
    /// Bars are drawn only when `visible`; otherwise events are ignored
    pub fn new(visible: bool) -> Self {
        let target = if visible {
            ProgressDrawTarget::stderr()
        } else {
            ProgressDrawTarget::hidden()
        };
        Self {
            multi: MultiProgress::with_draw_target(target),
            bars: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn add_task(&self, task: &DownloadTask) {
        let pb = self.multi.add(ProgressBar::new(task.total_bytes.unwrap_or(0)));
        if let Ok(bar_style) = ProgressStyle::default_bar().template(TEMPLATE) {
            pb.set_style(bar_style.progress_chars("█▓▒░  "));
        }

        let name = task.file_info.name.clone();
        pb.set_message(name.clone());
        pb.set_position(task.bytes_downloaded);

        self.bars.write().await.insert(task.task_id, (name, pb));
    }

    pub async fn handle_event(&self, event: &CoreEvent) {
        match event {
            CoreEvent::Progress(update) => {
                let bars = self.bars.read().await;
                if let Some((_, pb)) = bars.get(&update.task_id) {
                    if let Some(total) = update.total_bytes {
                        pb.set_length(total);
                    }
                    pb.set_position(update.bytes_downloaded);
                    pb.set_prefix(format!(
                        "{} {}",
                        format_speed(update.instantaneous_speed),
                        format_eta(update.eta.unwrap_or(0))
                    ));
                }
            }

            CoreEvent::TaskRetrying {
                task_id, attempt, ..
            } => {
                let bars = self.bars.read().await;
                if let Some((name, pb)) = bars.get(task_id) {
                    pb.set_message(format!("{} {}", name, style(format!("retry {}", attempt)).yellow()));
                }
            }

            CoreEvent::TaskStatusChanged {
                task_id,
                status,
                error,
            } => {
                let bars = self.bars.read().await;
                if let Some((name, pb)) = bars.get(task_id) {
                    match status {
                        TaskStatus::Completed => {
                            pb.finish_with_message(format!("{} {}", style("✓").green().bold(), name));
                        }
                        TaskStatus::Failed => {
                            let reason = error
                                .as_ref()
                                .map(|e| e.message.as_str())
                                .unwrap_or("Unknown error");
                            pb.abandon_with_message(format!(
                                "{} {}: {}",
                                style("✗").red().bold(),
                                name,
                                reason
                            ));
                        }
                        TaskStatus::Paused => {
                            pb.set_message(format!("{} {}", style("⏸").yellow(), name));
                        }
                        TaskStatus::Cancelled => {
                            pb.abandon_with_message(format!("{} {}", style("○").dim(), name));
                        }
                        TaskStatus::Downloading => pb.set_message(name.clone()),
                        TaskStatus::Pending => {}
                    }
                }
            }

            CoreEvent::JobStatusChanged { .. } => {}
        }
    }

    /// Clear all progress bars
    pub async fn clear(&self) {
        for (_, (_, pb)) in self.bars.write().await.drain() {
            if !pb.is_finished() {
                pb.finish_and_clear();
            }
        }
    }
}
