//! Best-effort interpretation of the analyzer's free-text reply.
//!
//! The prompt asks for a one-line reaction followed by a happiness
//! percentage on its own line. Models do not always comply, so nothing here
//! fails: the worst case is showing the reply as-is.

/// What the overlay should show for one reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedReply {
    Reaction {
        text: String,
        /// Percentage in `0.0..=100.0`.
        happiness: f64,
    },
    /// The reply had no usable reaction line; shown verbatim.
    Raw(String),
}

impl ParsedReply {
    pub fn happiness(&self) -> Option<f64> {
        match self {
            ParsedReply::Reaction { happiness, .. } => Some(*happiness),
            ParsedReply::Raw(_) => None,
        }
    }

    /// Overlay text, e.g. `Squirrel: "Nice tree." (Happiness: 80%)`.
    pub fn render(&self) -> String {
        match self {
            ParsedReply::Reaction { text, happiness } => {
                format!("Squirrel: \"{text}\" (Happiness: {happiness:.0}%)")
            }
            ParsedReply::Raw(raw) => raw.clone(),
        }
    }
}

/// First non-empty line is the reaction, the digits of the last non-empty
/// line are the happiness percentage.
pub fn parse_reply(reply: &str) -> ParsedReply {
    let mut lines = reply.lines().map(str::trim).filter(|l| !l.is_empty());

    let Some(reaction) = lines.next() else {
        return ParsedReply::Raw(reply.to_string());
    };
    let happiness_line = lines.last().unwrap_or(reaction);

    ParsedReply::Reaction {
        text: reaction.to_string(),
        happiness: parse_happiness(happiness_line),
    }
}

/// Strip every non-digit and read what is left, clamped to a percentage.
/// No digits at all means 0.
fn parse_happiness(line: &str) -> f64 {
    let digits: String = line.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return 0.0;
    }
    digits.parse::<f64>().unwrap_or(0.0).clamp(0.0, 100.0)
}
