//! Progress reporting for linkferry
//!
//! A [`Throttle`] gates how often a status message may change, and the
//! `render*` functions turn transfer numbers into the HTML status cards shown
//! on a job's ticket. Everything interpolated from users or servers goes
//! through [`escape_markup`] first.

use std::time::Duration;

use tokio::time::Instant;

/// Width of the progress bar in cells
const BAR_WIDTH: usize = 20;

/// Transfer direction a progress card refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Download,
    Upload,
}

impl Stage {
    /// Label printed at the top of the progress card
    pub fn label(&self) -> &'static str {
        match self {
            Stage::Download => "Downloading File",
            Stage::Upload => "Uploading File",
        }
    }

    /// Word used in failure cards ("Download failed: ...")
    pub fn noun(&self) -> &'static str {
        match self {
            Stage::Download => "Download",
            Stage::Upload => "Upload",
        }
    }
}

/// Minimum-interval gate for side-effecting updates
#[derive(Debug, Clone)]
pub struct Throttle {
    min_interval: Duration,
    last_emit: Option<Instant>,
}

impl Throttle {
    /// A throttle whose first `ready()` call succeeds immediately
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_emit: None,
        }
    }

    /// A throttle that considers "now" as its last emission
    pub fn started(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_emit: Some(Instant::now()),
        }
    }

    /// Returns true (and restarts the interval) at most once per interval
    pub fn ready(&mut self) -> bool {
        let now = Instant::now();
        match self.last_emit {
            Some(last) if now.duration_since(last) < self.min_interval => false,
            _ => {
                self.last_emit = Some(now);
                true
            }
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }
}

/// Escape `&`, `<`, `>` and quotes so a string can be embedded in HTML markup
pub fn escape_markup(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// Base-1024 size with two decimals, e.g. `1.50 MB`
pub fn human_size(bytes: f64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes.max(0.0);
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

/// Transfer rate, or `-` while it is not known yet
pub fn human_rate(bytes_per_sec: f64) -> String {
    if bytes_per_sec > 0.0 {
        format!("{}/s", human_size(bytes_per_sec))
    } else {
        "-".to_string()
    }
}

/// Compact duration such as `1h 2m 3s`; zero-valued leading units are omitted
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

/// Bounded bar for a completion ratio in `[0, 1]`
pub fn make_bar(ratio: f64, width: usize) -> String {
    let ratio = ratio.clamp(0.0, 1.0);
    let filled = (width as f64 * ratio).round() as usize;
    format!("{}{}", "█".repeat(filled), "░".repeat(width - filled))
}

/// Render a live progress card.
///
/// `total == 0` means the size is unknown: the bar is omitted and the ETA
/// shows `unknown`, as it does whenever `eta` is `None`.
pub fn render(
    stage: Stage,
    done: u64,
    total: u64,
    speed: f64,
    elapsed: Duration,
    eta: Option<Duration>,
) -> String {
    let mut card = format!("<b>{}</b>\n", stage.label());

    if total > 0 {
        let ratio = done as f64 / total as f64;
        card.push_str(&format!(
            "<code>[{}]</code> {:.1}%\n",
            make_bar(ratio, BAR_WIDTH),
            ratio.clamp(0.0, 1.0) * 100.0
        ));
        card.push_str(&format!(
            "{} / {}\n",
            human_size(done as f64),
            human_size(total as f64)
        ));
    } else {
        card.push_str(&format!("{} / unknown\n", human_size(done as f64)));
    }

    let eta = eta.map(format_duration).unwrap_or_else(|| "unknown".to_string());
    card.push_str(&format!(
        "Speed: {} • Elapsed: {} • ETA: {}",
        human_rate(speed),
        format_duration(elapsed),
        eta
    ));
    card
}

/// Card shown while a job waits for its turn
pub fn render_queued(position: usize) -> String {
    if position > 1 {
        format!("🕗 Queued • Position #{position}\nI’ll update this message when your turn starts.")
    } else {
        "Preparing…".to_string()
    }
}

/// Card shown when the worker picks up a job
pub fn render_starting() -> String {
    "⏳ Starting…".to_string()
}

/// Summary card shown between the two transfer directions and at the very end
#[derive(Debug, Clone, Default)]
pub struct DoneCard<'a> {
    pub title: &'a str,
    pub file_name: &'a str,
    pub size: u64,
    pub download_time: Option<Duration>,
    pub upload_time: Option<Duration>,
    pub link: Option<&'a str>,
}

/// Render a summary card; the file name and link are escaped
pub fn render_done(card: &DoneCard<'_>) -> String {
    let mut out = format!(
        "✅ <b>{}</b>\n📄 <code>{}</code>\n📦 {}",
        escape_markup(card.title),
        escape_markup(card.file_name),
        human_size(card.size as f64)
    );
    if let Some(t) = card.download_time {
        out.push_str(&format!("\n⬇️ Download: {}", format_duration(t)));
    }
    if let Some(t) = card.upload_time {
        out.push_str(&format!("\n⬆️ Upload: {}", format_duration(t)));
    }
    if let Some(link) = card.link {
        let link = escape_markup(link);
        out.push_str(&format!("\n🔗 <a href=\"{link}\">{link}</a>"));
    }
    out
}

/// Failure card; the error text comes from servers and is escaped
pub fn render_failed(stage: Option<Stage>, error: &str) -> String {
    match stage {
        Some(stage) => format!("❌ {} failed: {}", stage.noun(), escape_markup(error)),
        None => format!("❌ Failed: {}", escape_markup(error)),
    }
}
