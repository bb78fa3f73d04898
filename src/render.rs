use crate::config::DisplayConfig;
use crate::state::{DeviceRecord, ProcessRecord, Snapshot};

pub const TEMPERATURE_HOT_CELSIUS: u32 = 50;
pub const UTILIZATION_HIGH_PERCENT: u32 = 30;

const ABSENT_NUMBER: &str = "???";
const ABSENT_UTILIZATION: &str = "??";
const ABSENT_FIELD: &str = "--";
const ABSENT_MEMORY: &str = "?";

/// What a fragment means, independent of whether color is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Style {
    Host,
    Index,
    Name,
    Temperature,
    TemperatureHot,
    Utilization,
    UtilizationHigh,
    MemoryUsed,
    MemoryTotal,
    ProcessMemory,
    User,
    Command,
}

/// `escalated` once `value` reaches `threshold`; absent values never escalate.
pub fn threshold_style(value: Option<u32>, threshold: u32, normal: Style, escalated: Style) -> Style {
    match value {
        Some(v) if v >= threshold => escalated,
        _ => normal,
    }
}

pub fn temperature_style(value: Option<u32>) -> Style {
    threshold_style(
        value,
        TEMPERATURE_HOT_CELSIUS,
        Style::Temperature,
        Style::TemperatureHot,
    )
}

pub fn utilization_style(value: Option<u32>) -> Style {
    threshold_style(
        value,
        UTILIZATION_HIGH_PERCENT,
        Style::Utilization,
        Style::UtilizationHigh,
    )
}

#[derive(Debug, Clone, Copy)]
pub struct Palette {
    enabled: bool,
}

impl Palette {
    const RESET: &'static str = "\x1b[0m";

    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    fn code(style: Style) -> &'static str {
        match style {
            Style::Host => "\x1b[1m",
            Style::Index | Style::Command => "\x1b[0;36m",
            Style::Name => "\x1b[0;34m",
            Style::Temperature => "\x1b[0;31m",
            Style::TemperatureHot => "\x1b[1;31m",
            Style::Utilization => "\x1b[0;32m",
            Style::UtilizationHigh => "\x1b[1;32m",
            Style::MemoryUsed => "\x1b[1;33m",
            Style::MemoryTotal | Style::ProcessMemory => "\x1b[0;33m",
            Style::User => "\x1b[1;30m",
        }
    }

    pub fn paint(&self, style: Style, text: &str) -> String {
        if self.enabled {
            format!("{}{text}{}", Self::code(style), Self::RESET)
        } else {
            text.to_string()
        }
    }
}

fn or_placeholder<T: ToString>(value: Option<T>, placeholder: &str) -> String {
    value.map_or_else(|| placeholder.to_string(), |v| v.to_string())
}

/// Name column width: the configured minimum or the longest device name.
pub fn name_column_width(snapshot: &Snapshot, minimum: usize) -> usize {
    snapshot
        .devices()
        .iter()
        .map(|d| d.name.chars().count())
        .fold(minimum, usize::max)
}

pub fn render(snapshot: &Snapshot, opts: &DisplayConfig) -> String {
    let palette = Palette::new(opts.color);
    let width = name_column_width(snapshot, opts.gpuname_width);

    let mut out = render_header(snapshot, &palette);
    out.push('\n');
    for device in snapshot.devices() {
        out.push_str(&render_device(device, opts, width, &palette));
        out.push('\n');
    }
    out
}

pub fn render_header(snapshot: &Snapshot, palette: &Palette) -> String {
    format!(
        "{}  {}",
        palette.paint(Style::Host, &snapshot.hostname),
        snapshot.query_time.format("%c")
    )
}

pub fn render_device(
    device: &DeviceRecord,
    opts: &DisplayConfig,
    name_width: usize,
    palette: &Palette,
) -> String {
    let index = palette.paint(Style::Index, &format!("[{}]", device.index));
    let name = palette.paint(Style::Name, &format!("{:<name_width$}", device.name));
    let temperature = palette.paint(
        temperature_style(device.temperature_c),
        &format!("{:>3}'C", or_placeholder(device.temperature_c, ABSENT_NUMBER)),
    );
    let utilization = palette.paint(
        utilization_style(device.utilization_percent),
        &format!(
            "{:>3} %",
            or_placeholder(device.utilization_percent, ABSENT_UTILIZATION)
        ),
    );
    let memory_used = palette.paint(
        Style::MemoryUsed,
        &format!("{:>5}", or_placeholder(device.memory_used_mb, ABSENT_NUMBER)),
    );
    let memory_total = palette.paint(
        Style::MemoryTotal,
        &format!("{:>5}", or_placeholder(device.memory_total_mb, ABSENT_NUMBER)),
    );

    let mut line = format!(
        "{index} {name} |{temperature}, {utilization} | {memory_used} / {memory_total} MB |"
    );
    for process in &device.processes {
        line.push(' ');
        line.push_str(&render_process(process, opts, palette));
    }
    if device.restricted_processes > 0 {
        let hidden = render_process(&ProcessRecord::restricted(device.uuid.clone()), opts, palette);
        for _ in 0..device.restricted_processes {
            line.push(' ');
            line.push_str(&hidden);
        }
    }
    line
}

pub fn render_process(process: &ProcessRecord, opts: &DisplayConfig, palette: &Palette) -> String {
    let mut out = String::new();
    if !opts.show_cmd || opts.show_user {
        out.push_str(&palette.paint(
            Style::User,
            process.user.as_deref().unwrap_or(ABSENT_FIELD),
        ));
    }
    if opts.show_cmd {
        if !out.is_empty() {
            out.push(':');
        }
        let command = match (process.command.as_deref(), process.pid) {
            (Some(command), _) if !command.is_empty() => command.to_string(),
            (_, Some(pid)) => pid.to_string(),
            _ => ABSENT_FIELD.to_string(),
        };
        out.push_str(&palette.paint(Style::Command, &command));
    }
    if opts.show_pid {
        out.push('/');
        out.push_str(&or_placeholder(process.pid, ABSENT_FIELD));
    }
    let memory = format!("{}M", or_placeholder(process.used_memory_mb, ABSENT_MEMORY));
    out.push('(');
    out.push_str(&palette.paint(Style::ProcessMemory, &memory));
    out.push(')');
    out
}
