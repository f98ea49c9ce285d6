use console::style;

// ── Simple message helpers ─────────────────────────────────────────────────

pub fn print_success(msg: &str) {
    println!("{}", style(msg).green());
}

pub fn print_info(msg: &str) {
    println!("{}", style(msg).blue());
}

pub fn print_warn(msg: &str) {
    println!("{}", style(msg).yellow());
}

pub fn print_error(msg: &str) {
    eprintln!("{}", style(msg).red().bold());
}

// ── Boxed guide section ────────────────────────────────────────────────────

const BOX_WIDTH: usize = 64;
const BOX_H: &str = "─";
const BOX_V: &str = "│";
const BOX_BL: &str = "└";
const BOX_DIAMOND: &str = "◇";

/// A builder for rendering a bordered section like:
/// ```text
/// ◇ Title ──────────────────────────────────────
/// │
/// │  ▶ command     description
/// │
/// └─────────────────────────────────────────────
/// ```
pub struct GuideSection {
    title: String,
    lines: Vec<GuideLine>,
}

enum GuideLine {
    Text(String),
    Blank,
    Command(String, String),
    Status(String, String),
}

impl GuideSection {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            lines: Vec::new(),
        }
    }

    pub fn text(mut self, text: &str) -> Self {
        self.lines.push(GuideLine::Text(text.to_string()));
        self
    }

    pub fn blank(mut self) -> Self {
        self.lines.push(GuideLine::Blank);
        self
    }

    pub fn command(mut self, cmd: &str, desc: &str) -> Self {
        self.lines
            .push(GuideLine::Command(cmd.to_string(), desc.to_string()));
        self
    }

    pub fn status(mut self, label: &str, value: &str) -> Self {
        self.lines
            .push(GuideLine::Status(label.to_string(), value.to_string()));
        self
    }

    pub fn print(&self) {
        let v = style(BOX_V).dim();

        let title_display = format!(" {} ", self.title);
        let title_width = console::measure_text_width(&title_display);
        let remaining = if BOX_WIDTH > title_width + 3 {
            BOX_WIDTH - title_width - 3
        } else {
            4
        };
        println!();
        println!(
            " {} {}{}",
            style(BOX_DIAMOND).cyan(),
            style(&title_display).bold(),
            style(BOX_H.repeat(remaining)).dim(),
        );
        println!(" {}", v);

        for line in &self.lines {
            match line {
                GuideLine::Blank => println!(" {}", v),
                GuideLine::Text(t) => println!(" {}  {}", v, style(t).dim()),
                GuideLine::Command(cmd, desc) => {
                    println!(
                        " {}  {} {:<16} {}",
                        v,
                        style("▶").cyan(),
                        style(cmd).white(),
                        style(desc).dim()
                    );
                }
                GuideLine::Status(label, value) => {
                    println!(" {}  {}: {}", v, style(label).bold().cyan(), value);
                }
            }
        }

        println!(" {}", v);
        println!(
            " {}{}",
            style(BOX_BL).dim(),
            style(BOX_H.repeat(BOX_WIDTH)).dim()
        );
    }
}
