use std::fmt::Write as _;

use crate::runtime::TraceRecord;

/// Header of the execution trace table:
/// `| PC  | OPREG           | $0  | $1  | ... |` plus its separator
/// row. Register columns follow the configured register count.
pub fn format_trace_header(reg_count: u16) -> String {
    let mut head = String::from("| PC  | OPREG           |");
    let mut rule = String::from("| --- | --------------- |");
    for reg in 0..reg_count {
        let _ = write!(head, " ${reg:<2} |");
        rule.push_str(" --- |");
    }
    head.push('\n');
    head.push_str(&rule);
    head
}

/// One table row for an executed step.
pub fn format_trace_row(record: &TraceRecord) -> String {
    let mut row = format!("| {:<3} | {:<15} |", record.pc, record.text);
    for value in &record.regs {
        let _ = write!(row, " {value:<3} |");
    }
    row
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn header_matches_reg_count() {
        assert_eq!(
            format_trace_header(4),
            "| PC  | OPREG           | $0  | $1  | $2  | $3  |\n\
             | --- | --------------- | --- | --- | --- | --- |"
        );
        assert!(!format_trace_header(2).contains("$2"));
    }

    #[test]
    fn row_is_aligned() {
        let record = TraceRecord {
            pc: 3,
            text: "LDA $3, 64($0)".into(),
            regs: vec![0, 3, 64, 999],
        };
        assert_eq!(
            format_trace_row(&record),
            "| 3   | LDA $3, 64($0)  | 0   | 3   | 64  | 999 |"
        );
    }
}
