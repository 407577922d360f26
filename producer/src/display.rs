use squirrelcam_analyzer::ParsedReply;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::info;

/// Message from an analyzer round trip to the overlay owner.
#[derive(Debug, Clone, PartialEq)]
pub enum DisplayUpdate {
    /// A still is on its way to the analyzer.
    Processing,
    Reaction { text: String, happiness: f64 },
    /// Reply that did not parse into a reaction, shown as-is.
    Raw(String),
    Error(String),
}

impl From<ParsedReply> for DisplayUpdate {
    fn from(reply: ParsedReply) -> Self {
        match reply {
            ParsedReply::Reaction { text, happiness } => DisplayUpdate::Reaction { text, happiness },
            ParsedReply::Raw(raw) => DisplayUpdate::Raw(raw),
        }
    }
}

/// Overlay text shown over the live preview. Only the main task touches it.
#[derive(Debug, Default)]
pub struct OverlayState {
    text: String,
    happiness: Option<f64>,
}

impl OverlayState {
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn happiness(&self) -> Option<f64> {
        self.happiness
    }

    pub fn apply(&mut self, update: DisplayUpdate) {
        match update {
            DisplayUpdate::Processing => {
                self.text = "Processing image...".into();
            }
            DisplayUpdate::Reaction { text, happiness } => {
                self.text = ParsedReply::Reaction { text, happiness }.render();
                self.happiness = Some(happiness);
            }
            DisplayUpdate::Raw(raw) => {
                self.text = raw;
                self.happiness = None;
            }
            DisplayUpdate::Error(e) => {
                self.text = format!("Error: {e}");
            }
        }
    }
}

/// Drive the overlay from display updates until every sender is gone.
pub async fn run_overlay(mut updates: UnboundedReceiver<DisplayUpdate>) -> OverlayState {
    let mut overlay = OverlayState::default();
    while let Some(update) = updates.recv().await {
        overlay.apply(update);
        info!(overlay = overlay.text(), happiness = ?overlay.happiness(), "overlay updated");
    }
    overlay
}
