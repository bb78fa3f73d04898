use crate::collectors::{parse_u64_loose, split_csv_row, supported};
use crate::exec::CommandLine;
use crate::state::DeviceRecord;
use thiserror::Error;
use tracing::debug;

pub const DEVICE_QUERY_COLUMNS: [&str; 7] = [
    "index",
    "uuid",
    "name",
    "temperature.gpu",
    "utilization.gpu",
    "memory.used",
    "memory.total",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MalformedRecordError {
    #[error("expected {expected} columns but found {found} in `{line}`")]
    ColumnCount {
        expected: usize,
        found: usize,
        line: String,
    },
    #[error("device index `{value}` is not a number in `{line}`")]
    Index { value: String, line: String },
}

pub fn device_query_command(nvidia_smi: &str) -> CommandLine {
    CommandLine::new(nvidia_smi)
        .arg(format!("--query-gpu={}", DEVICE_QUERY_COLUMNS.join(",")))
        .arg("--format=csv,noheader,nounits")
}

pub fn parse_devices(text: &str) -> Result<Vec<DeviceRecord>, MalformedRecordError> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(parse_device_row)
        .collect()
}

fn parse_device_row(line: &str) -> Result<DeviceRecord, MalformedRecordError> {
    let fields = split_csv_row(line);
    if fields.len() != DEVICE_QUERY_COLUMNS.len() {
        return Err(MalformedRecordError::ColumnCount {
            expected: DEVICE_QUERY_COLUMNS.len(),
            found: fields.len(),
            line: line.to_string(),
        });
    }

    let index = fields[0]
        .parse::<u32>()
        .map_err(|_| MalformedRecordError::Index {
            value: fields[0].to_string(),
            line: line.to_string(),
        })?;

    Ok(DeviceRecord {
        index,
        uuid: fields[1].to_string(),
        name: fields[2].to_string(),
        temperature_c: numeric_field(DEVICE_QUERY_COLUMNS[3], fields[3]),
        utilization_percent: numeric_field(DEVICE_QUERY_COLUMNS[4], fields[4]),
        memory_used_mb: numeric_field(DEVICE_QUERY_COLUMNS[5], fields[5]),
        memory_total_mb: numeric_field(DEVICE_QUERY_COLUMNS[6], fields[6]),
        processes: Vec::new(),
        restricted_processes: 0,
    })
}

fn numeric_field<T: TryFrom<u64>>(column: &str, raw: &str) -> Option<T> {
    let value = supported(raw)?;
    let parsed = parse_u64_loose(value).and_then(|v| T::try_from(v).ok());
    if parsed.is_none() {
        debug!(column, raw, "unparsable device field treated as absent");
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_device_line() {
        let devices = parse_devices("0, GPU-aaa, Tesla K80, 65, 42, 1024, 12000\n")
            .expect("valid device text");
        assert_eq!(devices.len(), 1);
        let dev = &devices[0];
        assert_eq!(dev.index, 0);
        assert_eq!(dev.uuid, "GPU-aaa");
        assert_eq!(dev.name, "Tesla K80");
        assert_eq!(dev.temperature_c, Some(65));
        assert_eq!(dev.utilization_percent, Some(42));
        assert_eq!(dev.memory_used_mb, Some(1024));
        assert_eq!(dev.memory_total_mb, Some(12000));
        assert!(dev.processes.is_empty());
    }

    #[test]
    fn not_supported_fields_become_absent() {
        let devices =
            parse_devices("0, GPU-aaa, Tesla K80, [Not Supported], [Not Supported], 0, 12000\n")
                .expect("valid device text");
        let dev = &devices[0];
        assert_eq!(dev.temperature_c, None);
        assert_eq!(dev.utilization_percent, None);
        assert_eq!(dev.memory_used_mb, Some(0));
        assert_eq!(dev.memory_total_mb, Some(12000));
    }

    #[test]
    fn other_non_numeric_values_become_absent() {
        let devices = parse_devices("1, GPU-bbb, GeForce GT 710, [N/A], 7, [Unknown Error], 2048")
            .expect("valid device text");
        assert_eq!(devices[0].temperature_c, None);
        assert_eq!(devices[0].memory_used_mb, None);
        assert_eq!(devices[0].utilization_percent, Some(7));
    }

    #[test]
    fn blank_lines_are_skipped_and_order_is_kept() {
        let text = "\n1, GPU-bbb, Tesla V100, 30, 0, 0, 16000\n\n0, GPU-aaa, Tesla K80, 31, 1, 2, 12000\n";
        let devices = parse_devices(text).expect("valid device text");
        let uuids: Vec<_> = devices.iter().map(|d| d.uuid.as_str()).collect();
        assert_eq!(uuids, vec!["GPU-bbb", "GPU-aaa"]);
    }

    #[test]
    fn parsing_is_deterministic() {
        let text = "0, GPU-aaa, Tesla K80, 65, 42, 1024, 12000\n1, GPU-bbb, Tesla K80, Not Supported, 3, 1, 12000";
        assert_eq!(parse_devices(text), parse_devices(text));
    }

    #[test]
    fn wrong_column_count_is_malformed() {
        let err = parse_devices("0, GPU-aaa, Tesla K80").expect_err("too few columns");
        assert!(matches!(
            err,
            MalformedRecordError::ColumnCount {
                expected: 7,
                found: 3,
                ..
            }
        ));
    }

    #[test]
    fn non_numeric_index_is_malformed() {
        let err = parse_devices("x, GPU-aaa, Tesla K80, 1, 2, 3, 4").expect_err("bad index");
        assert!(matches!(err, MalformedRecordError::Index { .. }));
    }

    #[test]
    fn query_command_lists_columns_in_order() {
        assert_eq!(
            device_query_command("nvidia-smi").to_string(),
            "nvidia-smi --query-gpu=index,uuid,name,temperature.gpu,utilization.gpu,memory.used,memory.total --format=csv,noheader,nounits"
        );
    }
}
