//! Console output helpers.

use console::style;

pub fn heading(text: &str) {
    println!("{}", style(text).bold().underlined());
}

pub fn success(text: &str) {
    println!("{} {}", style("ok").green().bold(), text);
}

pub fn warning(text: &str) {
    eprintln!("{} {}", style("warning").yellow().bold(), text);
}

pub fn field(name: &str, value: &str) {
    println!("  {} {}", style(format!("{}:", name)).dim(), value);
}

/// Render a used/limit pair with a percentage.
pub fn quota_line(name: &str, used: f64, limit: f64) {
    let pct = if limit > 0.0 { used / limit * 100.0 } else { 0.0 };
    let rendered = format!("{:.1} / {:.1} ({:.0}%)", used, limit, pct);
    let value = if pct >= 90.0 {
        style(rendered).red().to_string()
    } else if pct >= 70.0 {
        style(rendered).yellow().to_string()
    } else {
        rendered
    };
    println!("  {:<12} {}", name, value);
}
