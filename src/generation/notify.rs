// Advisory notifications for the UI layer

use super::types::GenerationMode;
use std::fmt;
use tokio::sync::mpsc::UnboundedSender;

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// The last txt2img output became the init image
    ImageHandedOff { to: GenerationMode },
    StrengthDefaulted { mode: GenerationMode, strength: f64 },
    GenerationStarted { mode: GenerationMode },
    GenerationCompleted { images: usize, seed: u64 },
    GenerationFailed { message: String },
    PersistenceFailed { message: String },
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notification::ImageHandedOff { to } => {
                write!(f, "Generated image moved to {}", to.display_name())
            }
            Notification::StrengthDefaulted { mode, strength } => {
                write!(f, "Strength set to {} for {}", strength, mode.display_name())
            }
            Notification::GenerationStarted { mode } => {
                write!(f, "{} started", mode.display_name())
            }
            Notification::GenerationCompleted { images, seed } => {
                write!(f, "Generated {} image(s) with seed {}", images, seed)
            }
            Notification::GenerationFailed { message } => f.write_str(message),
            Notification::PersistenceFailed { message } => {
                write!(f, "Image could not be saved: {}", message)
            }
        }
    }
}

/// Receives advisory events; implementations must not block
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Logs every notification
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notification: Notification) {
        match &notification {
            Notification::GenerationFailed { .. } | Notification::PersistenceFailed { .. } => {
                tracing::warn!("{}", notification)
            }
            _ => tracing::info!("{}", notification),
        }
    }
}

impl Notifier for UnboundedSender<Notification> {
    fn notify(&self, notification: Notification) {
        if self.send(notification).is_err() {
            tracing::debug!("Notification receiver dropped");
        }
    }
}
