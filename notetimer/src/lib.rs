//! Note-timer domain library: stopwatch state machines and the markdown
//! log-table mutation engine behind them.
//! The core stays pure: every document change is computed as a complete new
//! text and handed back to the storage boundary for one whole-file write.

pub mod core {
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    /* ------------------------------- IDs ------------------------------- */

    /// Stable identifier minted for a timer block and persisted into its
    /// body as the `_timerUID` option, so the block's logical identity
    /// survives re-renders.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct TimerId(pub Uuid);

    impl TimerId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    impl std::fmt::Display for TimerId {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            self.0.fmt(f)
        }
    }

    /* ------------------------------ Spans ------------------------------ */

    /// Byte range into a note's text.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Span {
        pub start: usize,
        pub end: usize,
    }

    impl Span {
        pub fn slice<'a>(&self, source: &'a str) -> &'a str {
            &source[self.start..self.end]
        }

        pub fn len(&self) -> usize {
            self.end - self.start
        }

        pub fn is_empty(&self) -> bool {
            self.start == self.end
        }
    }

    /* --------------------------- Timer blocks --------------------------- */

    /// A fenced timer region located in a note.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TimerBlock {
        /// From the first byte of the opening fence to just past the closing
        /// fence token.
        pub fence: Span,
        /// The body between the opening fence line and the closing fence.
        pub body: Span,
        /// Typed per-block overrides parsed from the body.
        pub options: BlockOptions,
    }

    impl TimerBlock {
        /// Offset at which synthesized log-table text is spliced.
        pub fn insertion_point(&self) -> usize {
            self.fence.end
        }
    }

    /* ---------------------------- Configuration ---------------------------- */

    /// How a formatted date is decorated in a log row.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum DateLinking {
        #[default]
        None,
        /// `#2024-01-01`
        Tag,
        /// `[[2024-01-01]]`
        Link,
    }

    /// Whether timer buttons show icon glyphs or plain text.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum ButtonLabels {
        #[default]
        Icons,
        Text,
    }

    /// Which of the two table wire formats a log table uses.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum LogStyle {
        /// `| date | duration | comments|` with a clock-string duration.
        #[default]
        Dated,
        /// `| Start | Stop | Duration | Comments |` with decimal-hour
        /// durations and a running `Total Time:` line.
        Interval,
    }

    /// Global options. The settings store merges persisted values over these
    /// defaults; a block's inline options override them per render.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct TimerConfig {
        /// Run the log flow when a running timer stops.
        pub auto_log: bool,
        /// chrono strftime pattern applied to row dates.
        pub date_format: String,
        pub date_linking: DateLinking,
        /// Show milliseconds in the live display and clock durations.
        pub ms_display: bool,
        pub button_labels: ButtonLabels,
        pub start_button_text: String,
        pub stop_button_text: String,
        pub reset_button_text: String,
        pub show_reset_button: bool,
        /// Reset while running re-stamps the start instead of stopping.
        pub continue_running_on_reset: bool,
        pub log_style: LogStyle,
    }

    impl Default for TimerConfig {
        fn default() -> Self {
            Self {
                auto_log: false,
                date_format: "%Y-%m-%d".to_string(),
                date_linking: DateLinking::None,
                ms_display: true,
                button_labels: ButtonLabels::Icons,
                start_button_text: "start".to_string(),
                stop_button_text: "stop".to_string(),
                reset_button_text: "reset".to_string(),
                show_reset_button: true,
                continue_running_on_reset: false,
                log_style: LogStyle::Dated,
            }
        }
    }

    /// Per-block overrides parsed from `key: value` lines inside the fence.
    /// Every field is optional; unset falls back to the global config.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct BlockOptions {
        pub log: Option<bool>,
        pub ms: Option<bool>,
        pub button_labels: Option<ButtonLabels>,
        pub start_button_text: Option<String>,
        pub stop_button_text: Option<String>,
        pub reset_button_text: Option<String>,
        pub show_reset_button: Option<bool>,
        pub continue_running_on_reset: Option<bool>,
        pub log_style: Option<LogStyle>,
        /// The reserved `_timerUID` token. Written by the system, never by
        /// the user, and preserved verbatim on every rewrite.
        pub timer_uid: Option<String>,
        /// Unrecognized keys in body order, kept so callers can ignore them
        /// without losing them.
        #[serde(default)]
        pub extra: IndexMap<String, String>,
    }

    impl TimerConfig {
        /// Block override beats the global value wherever one is explicitly
        /// set; everything else falls through unchanged.
        pub fn merged(&self, opts: &BlockOptions) -> TimerConfig {
            TimerConfig {
                auto_log: opts.log.unwrap_or(self.auto_log),
                date_format: self.date_format.clone(),
                date_linking: self.date_linking,
                ms_display: opts.ms.unwrap_or(self.ms_display),
                button_labels: opts.button_labels.unwrap_or(self.button_labels),
                start_button_text: opts
                    .start_button_text
                    .clone()
                    .unwrap_or_else(|| self.start_button_text.clone()),
                stop_button_text: opts
                    .stop_button_text
                    .clone()
                    .unwrap_or_else(|| self.stop_button_text.clone()),
                reset_button_text: opts
                    .reset_button_text
                    .clone()
                    .unwrap_or_else(|| self.reset_button_text.clone()),
                show_reset_button: opts.show_reset_button.unwrap_or(self.show_reset_button),
                continue_running_on_reset: opts
                    .continue_running_on_reset
                    .unwrap_or(self.continue_running_on_reset),
                log_style: opts.log_style.unwrap_or(self.log_style),
            }
        }
    }

    /* ----------------------------- Log tables ----------------------------- */

    /// A located log table. Offsets are byte positions into the text the
    /// table was located in; any mutation invalidates them.
    #[derive(Debug, Clone, PartialEq)]
    pub struct LogTable {
        /// Offset of the heading marker match.
        pub heading: usize,
        /// Start of the header row line.
        pub header: usize,
        /// Start of the separator row line.
        pub separator: usize,
        /// Splice point for a new row: the separator row's terminating line
        /// break. Row text carries its own leading newline, so the row lands
        /// between the separator and any existing data rows.
        pub insert_at: usize,
        /// The `Total Time:` line, when the table carries one.
        pub total_line: Option<Span>,
        /// Data rows in document order, one vector of trimmed cells per row.
        pub rows: Vec<Vec<String>>,
    }

    /// One log entry. The trailing comment cell is user-owned and always
    /// rendered empty.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct LogRow {
        pub start: String,
        pub stop: Option<String>,
        pub duration: String,
    }

    impl LogRow {
        /// Renders the row as a single table line with a leading line break.
        pub fn render(&self) -> String {
            match &self.stop {
                Some(stop) => format!("\n| {} | {} | {} |  |", self.start, stop, self.duration),
                None => format!("\n| {} | {} |  |", self.start, self.duration),
            }
        }
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum TimerError {
        /// The heading is present but fewer than the required structural
        /// lines follow it.
        #[error("log table heading at offset {0} is not followed by a full header and separator")]
        MalformedTable(usize),
        /// The opening fence never closes; logging against the block is
        /// disabled and the block reads to end-of-document.
        #[error("timer block opened at offset {0} has no closing fence")]
        UnterminatedBlock(usize),
    }

    #[cfg(test)]
    mod tests {
        use super::{BlockOptions, ButtonLabels, DateLinking, LogRow, LogStyle, TimerConfig};

        #[test]
        fn block_override_beats_global_default() {
            let config = TimerConfig {
                auto_log: true,
                ..TimerConfig::default()
            };
            let opts = BlockOptions {
                log: Some(false),
                ms: Some(false),
                ..BlockOptions::default()
            };
            let effective = config.merged(&opts);
            assert!(!effective.auto_log);
            assert!(!effective.ms_display);
        }

        #[test]
        fn unset_override_falls_back_to_global() {
            let config = TimerConfig {
                auto_log: true,
                continue_running_on_reset: true,
                ..TimerConfig::default()
            };
            let effective = config.merged(&BlockOptions::default());
            assert!(effective.auto_log);
            assert!(effective.continue_running_on_reset);
            assert_eq!(effective.date_format, "%Y-%m-%d");
        }

        #[test]
        fn partial_settings_json_merges_over_defaults() {
            let parsed: TimerConfig =
                serde_json::from_str(r#"{ "auto_log": true, "date_linking": "tag" }"#)
                    .expect("partial settings should deserialize");
            assert!(parsed.auto_log);
            assert_eq!(parsed.date_linking, DateLinking::Tag);
            assert!(parsed.ms_display);
            assert_eq!(parsed.button_labels, ButtonLabels::Icons);
            assert_eq!(parsed.log_style, LogStyle::Dated);
        }

        #[test]
        fn row_renders_with_empty_comment_cell() {
            let dated = LogRow {
                start: "2024-01-01".into(),
                stop: None,
                duration: "00:05:32".into(),
            };
            assert_eq!(dated.render(), "\n| 2024-01-01 | 00:05:32 |  |");

            let interval = LogRow {
                start: "2024-01-01".into(),
                stop: Some("2024-01-02".into()),
                duration: "1.500".into(),
            };
            assert_eq!(interval.render(), "\n| 2024-01-01 | 2024-01-02 | 1.500 |  |");
        }
    }
}

pub mod locate {
    //! Marker scanning and offset arithmetic over raw note text.
    //!
    //! Deliberately substring-based: locating one fenced block and one table
    //! heading does not need a markdown parser, and keeping the scanning
    //! behind this module lets a real parser replace it without touching
    //! callers. Option lines inside the fence are parsed with `nom`.

    use crate::core::{
        BlockOptions, ButtonLabels, LogStyle, LogTable, Span, TimerBlock, TimerError,
    };
    use nom::{
        IResult,
        bytes::complete::take_till1,
        character::complete::{char, line_ending, not_line_ending, space0},
        combinator::{map, opt},
        error::VerboseError,
        sequence::terminated,
    };

    /// Heading marker identifying a log table, matched case-insensitively.
    pub const LOG_HEADING_MARKER: &str = "# timer log";
    /// Opening fence token for a timer block.
    pub const FENCE_OPEN: &str = "```timer";
    /// Closing fence token.
    pub const FENCE_CLOSE: &str = "```";
    /// Prefix of the running-total line in interval tables.
    pub const TOTAL_PREFIX: &str = "Total Time:";

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /* --------------------------- Offset locator --------------------------- */

    /// Returns the offset of the third line break strictly after `anchor`:
    /// with the anchor on the line preceding the header row, that is the end
    /// of the separator row. A row line with a leading newline spliced at
    /// this offset lands immediately after the separator and before any
    /// existing data rows, so the splice also succeeds on a table with zero
    /// rows. Errors when the table is truncated.
    pub fn next_data_row_start(text: &str, anchor: usize) -> Result<usize, TimerError> {
        nth_line_break_after(text, anchor, 3).ok_or(TimerError::MalformedTable(anchor))
    }

    fn nth_line_break_after(text: &str, anchor: usize, n: usize) -> Option<usize> {
        let bytes = text.as_bytes();
        let mut remaining = n;
        let mut pos = anchor.saturating_add(1);
        while pos < bytes.len() {
            if bytes[pos] == b'\n' {
                remaining -= 1;
                if remaining == 0 {
                    return Some(pos);
                }
            }
            pos += 1;
        }
        None
    }

    /// ASCII case-insensitive substring search starting at `from`.
    fn find_ci(text: &str, needle: &str, from: usize) -> Option<usize> {
        let hay = text.as_bytes();
        let ned = needle.as_bytes();
        if ned.is_empty() || hay.len() < ned.len() {
            return None;
        }
        let last = hay.len() - ned.len();
        (from..=last).find(|&i| hay[i..i + ned.len()].eq_ignore_ascii_case(ned))
    }

    /* ---------------------------- Table locator ---------------------------- */

    /// Locates the log table at or after `from` (callers pass a block's fence
    /// end so each block stays on its own table). `None` means the heading is
    /// absent and the table must be synthesized first.
    pub fn find_log_table(text: &str, from: usize) -> Result<Option<LogTable>, TimerError> {
        let Some(heading) = find_ci(text, LOG_HEADING_MARKER, from) else {
            return Ok(None);
        };

        // Interval tables carry a running-total line between the heading and
        // the header row; shift the anchor past it so the three-line-break
        // rule still lands on the separator row's end.
        let heading_end =
            nth_line_break_after(text, heading, 1).ok_or(TimerError::MalformedTable(heading))?;
        let total_line = total_line_at(text, heading_end + 1);
        let anchor = if total_line.is_some() { heading_end } else { heading };

        let header = nth_line_break_after(text, anchor, 1)
            .map(|nl| nl + 1)
            .ok_or(TimerError::MalformedTable(heading))?;
        let separator = nth_line_break_after(text, anchor, 2)
            .map(|nl| nl + 1)
            .ok_or(TimerError::MalformedTable(heading))?;
        let insert_at =
            next_data_row_start(text, anchor).map_err(|_| TimerError::MalformedTable(heading))?;

        // Data rows: contiguous delimiter-prefixed lines after the separator.
        let mut rows = Vec::new();
        for line in text[insert_at + 1..].lines() {
            if !line.trim_start().starts_with('|') {
                break;
            }
            rows.push(split_cells(line));
        }

        Ok(Some(LogTable {
            heading,
            header,
            separator,
            insert_at,
            total_line,
            rows,
        }))
    }

    fn total_line_at(text: &str, line_start: usize) -> Option<Span> {
        if line_start >= text.len() {
            return None;
        }
        let line = text[line_start..].lines().next().unwrap_or("");
        if line.trim_start().starts_with(TOTAL_PREFIX) {
            Some(Span {
                start: line_start,
                end: line_start + line.len(),
            })
        } else {
            None
        }
    }

    /// Splits a table line into trimmed interior cells, dropping the empty
    /// boundary artifacts produced by the leading/trailing delimiters.
    pub fn split_cells(line: &str) -> Vec<String> {
        let trimmed = line.trim();
        let inner = trimmed.strip_prefix('|').unwrap_or(trimmed);
        let inner = inner.strip_suffix('|').unwrap_or(inner);
        inner.split('|').map(|cell| cell.trim().to_string()).collect()
    }

    /* ---------------------------- Block locator ---------------------------- */

    /// Locates the first timer fence at or after `from` and parses its body
    /// options. `None` means no opening fence exists.
    pub fn find_timer_block(text: &str, from: usize) -> Result<Option<TimerBlock>, TimerError> {
        let Some(start) = find_ci(text, FENCE_OPEN, from) else {
            return Ok(None);
        };
        let after_open = start + FENCE_OPEN.len();
        let close =
            find_ci(text, FENCE_CLOSE, after_open).ok_or(TimerError::UnterminatedBlock(start))?;

        let body_start = text[after_open..close]
            .find('\n')
            .map(|i| after_open + i + 1)
            .unwrap_or(close);
        let body = Span {
            start: body_start,
            end: close,
        };
        let fence = Span {
            start,
            end: close + FENCE_CLOSE.len(),
        };
        let options = parse_block_options(body.slice(text));

        Ok(Some(TimerBlock {
            fence,
            body,
            options,
        }))
    }

    /// All timer blocks in document order. An unterminated trailing fence
    /// stops the scan with its error.
    pub fn find_timer_blocks(text: &str) -> Result<Vec<TimerBlock>, TimerError> {
        let mut blocks = Vec::new();
        let mut from = 0;
        while let Some(block) = find_timer_block(text, from)? {
            from = block.fence.end;
            blocks.push(block);
        }
        Ok(blocks)
    }

    /* ---------------------------- Inline options ---------------------------- */

    fn option_line(i: &str) -> PResult<'_, (&str, &str)> {
        let (i, _) = space0(i)?;
        let (i, key) = take_till1(|c: char| c == ':' || c == '\n' || c == '\r')(i)?;
        let (i, _) = char(':')(i)?;
        let (i, _) = space0(i)?;
        let (i, value) = not_line_ending(i)?;
        let (i, _) = opt(line_ending)(i)?;
        Ok((i, (key.trim_end(), value.trim_end())))
    }

    fn skip_line(i: &str) -> PResult<'_, &str> {
        map(terminated(not_line_ending, opt(line_ending)), |s: &str| s)(i)
    }

    /// Parses `key: value` lines from a fence body. Keys match
    /// case-insensitively; lines that are not key/value pairs are skipped.
    pub fn parse_block_options(body: &str) -> BlockOptions {
        let mut opts = BlockOptions::default();
        let mut rest = body;
        while !rest.is_empty() {
            match option_line(rest) {
                Ok((r, (key, value))) => {
                    apply_option(&mut opts, key, value);
                    rest = r;
                }
                Err(_) => match skip_line(rest) {
                    Ok((r, _)) if r.len() < rest.len() => rest = r,
                    _ => break,
                },
            }
        }
        opts
    }

    fn apply_option(opts: &mut BlockOptions, key: &str, value: &str) {
        if key.eq_ignore_ascii_case("log") {
            opts.log = parse_bool(value);
        } else if key.eq_ignore_ascii_case("ms") {
            opts.ms = parse_bool(value);
        } else if key.eq_ignore_ascii_case("buttonLabels") {
            opts.button_labels = parse_button_labels(value);
        } else if key.eq_ignore_ascii_case("startButtonText") {
            opts.start_button_text = Some(value.to_string());
        } else if key.eq_ignore_ascii_case("stopButtonText") {
            opts.stop_button_text = Some(value.to_string());
        } else if key.eq_ignore_ascii_case("resetButtonText") {
            opts.reset_button_text = Some(value.to_string());
        } else if key.eq_ignore_ascii_case("showResetButton") {
            opts.show_reset_button = parse_bool(value);
        } else if key.eq_ignore_ascii_case("continueRunningOnReset") {
            opts.continue_running_on_reset = parse_bool(value);
        } else if key.eq_ignore_ascii_case("logStyle") {
            opts.log_style = parse_log_style(value);
        } else if key.eq_ignore_ascii_case("_timerUID") {
            opts.timer_uid = Some(value.to_string());
        } else {
            opts.extra.insert(key.to_string(), value.to_string());
        }
    }

    /// Only an explicit true/false overrides the global default.
    fn parse_bool(value: &str) -> Option<bool> {
        if value.eq_ignore_ascii_case("true") {
            Some(true)
        } else if value.eq_ignore_ascii_case("false") {
            Some(false)
        } else {
            None
        }
    }

    fn parse_button_labels(value: &str) -> Option<ButtonLabels> {
        if value.eq_ignore_ascii_case("icons") {
            Some(ButtonLabels::Icons)
        } else if value.eq_ignore_ascii_case("text") {
            Some(ButtonLabels::Text)
        } else {
            None
        }
    }

    fn parse_log_style(value: &str) -> Option<LogStyle> {
        if value.eq_ignore_ascii_case("dated") {
            Some(LogStyle::Dated)
        } else if value.eq_ignore_ascii_case("interval") {
            Some(LogStyle::Interval)
        } else {
            None
        }
    }

}

pub mod table {
    //! Rendering of log-table skeletons, row markers, and durations.

    use crate::core::{DateLinking, LogStyle};
    use crate::stopwatch::ElapsedParts;
    use chrono::NaiveDateTime;
    use chrono::format::{Item, StrftimeItems};
    use std::time::Duration;

    /// Markdown skeleton for a brand-new log table, spliced immediately
    /// after a block's closing fence. Pure and stable: repeated calls return
    /// identical text, and the caller owns the document mutation.
    pub fn build_log_table_text(style: LogStyle) -> String {
        match style {
            LogStyle::Dated => "\n###### Timer Log\n| date | duration | comments|\n| ---- | -------- | ------- |\n"
                .to_string(),
            LogStyle::Interval => "\n###### Timer Log\nTotal Time: 0.000\n| Start | Stop | Duration | Comments |\n| ----- | ---- | -------- | ------- |\n"
                .to_string(),
        }
    }

    /// Formats a row timestamp and applies the configured link decoration.
    /// An invalid strftime pattern falls back to the default so a bad
    /// setting cannot poison a note.
    pub fn format_marker(ts: NaiveDateTime, date_format: &str, linking: DateLinking) -> String {
        let items: Vec<Item<'_>> = StrftimeItems::new(date_format).collect();
        let formatted = if items.iter().any(|item| matches!(item, Item::Error)) {
            ts.format("%Y-%m-%d").to_string()
        } else {
            ts.format_with_items(items.into_iter()).to_string()
        };
        match linking {
            DateLinking::None => formatted,
            DateLinking::Tag => format!("#{formatted}"),
            DateLinking::Link => format!("[[{formatted}]]"),
        }
    }

    /// Zero-padded clock rendering of an elapsed duration; days fold into
    /// the hour field.
    pub fn format_duration_clock(elapsed: Duration, ms: bool) -> String {
        ElapsedParts::from_duration(elapsed).clock(ms)
    }

    /// Decimal-hours rendering with exactly three fractional digits.
    pub fn format_duration_hours(elapsed: Duration) -> String {
        format!("{:.3}", elapsed.as_secs_f64() / 3600.0)
    }

}

pub mod mutate {
    //! Pure document transformations. Every function takes the full note
    //! text and returns the replacement text; nothing here performs I/O.

    use crate::core::{LogRow, LogStyle, LogTable, TimerBlock};
    use crate::locate::TOTAL_PREFIX;
    use crate::table::build_log_table_text;

    fn splice(text: &str, at: usize, insertion: &str) -> String {
        let mut out = String::with_capacity(text.len() + insertion.len());
        out.push_str(&text[..at]);
        out.push_str(insertion);
        out.push_str(&text[at..]);
        out
    }

    /// Appends one row at the located insertion point. Bytes on either side
    /// of the splice are carried over untouched.
    pub fn append_row(text: &str, insert_at: usize, row: &LogRow) -> String {
        splice(text, insert_at, &row.render())
    }

    /// Splices a freshly built log table immediately after the block's
    /// closing fence.
    pub fn create_log_table(text: &str, block: &TimerBlock, style: LogStyle) -> String {
        splice(text, block.insertion_point(), &build_log_table_text(style))
    }

    /// Sums the duration cells of the located table and rewrites its
    /// `Total Time:` line. Unparseable or missing cells contribute zero; a
    /// table without a total line is returned untouched. Idempotent.
    pub fn recompute_total(text: &str, table: &LogTable) -> String {
        let Some(total_line) = table.total_line else {
            return text.to_string();
        };
        let total = sum_durations(&table.rows);
        let mut out = String::with_capacity(text.len() + 8);
        out.push_str(&text[..total_line.start]);
        out.push_str(TOTAL_PREFIX);
        out.push_str(&format!(" {total:.3}"));
        out.push_str(&text[total_line.end..]);
        out
    }

    /// Duration-column total. The duration cell sits immediately before the
    /// trailing comment cell; rows too short to have one contribute zero.
    pub fn sum_durations(rows: &[Vec<String>]) -> f64 {
        rows.iter()
            .map(|cells| match cells.len().checked_sub(2) {
                Some(idx) => cells[idx].trim().parse::<f64>().unwrap_or(0.0),
                None => 0.0,
            })
            .sum()
    }

    /// Writes a minted identifier into the block body as a `_timerUID:`
    /// line, kept as the last body line just before the closing fence.
    pub fn stamp_timer_uid(text: &str, block: &TimerBlock, uid: &str) -> String {
        let at = block.body.end;
        let mut insertion = String::new();
        if !text[..at].ends_with('\n') {
            insertion.push('\n');
        }
        insertion.push_str("_timerUID: ");
        insertion.push_str(uid);
        insertion.push('\n');
        splice(text, at, &insertion)
    }

    #[cfg(test)]
    mod tests {
        use super::{append_row, create_log_table, recompute_total, stamp_timer_uid};
        use crate::core::{LogRow, LogStyle};
        use crate::locate::{find_log_table, find_timer_block};

        fn dated_row(date: &str, duration: &str) -> LogRow {
            LogRow {
                start: date.to_string(),
                stop: None,
                duration: duration.to_string(),
            }
        }

        #[test]
        fn append_adds_one_row_and_preserves_surroundings() {
            let text = "before\n```timer\n```\n###### Timer Log\n| date | duration | comments|\n| ---- | -------- | ------- |\n| 2024-01-01 | 00:05:32 |  |\nafter\n";
            let table = find_log_table(text, 0)
                .expect("locate")
                .expect("heading present");
            let before_rows = table.rows.len();

            let updated = append_row(text, table.insert_at, &dated_row("2024-01-02", "00:00:10"));

            assert_eq!(&updated[..table.insert_at], &text[..table.insert_at]);
            assert!(updated.ends_with("after\n"));
            let relocated = find_log_table(&updated, 0)
                .expect("relocate")
                .expect("heading still present");
            assert_eq!(relocated.rows.len(), before_rows + 1);
            // Newest row lands directly under the separator.
            assert_eq!(relocated.rows[0], vec!["2024-01-02", "00:00:10", ""]);
            assert_eq!(relocated.rows[1], vec!["2024-01-01", "00:05:32", ""]);
        }

        #[test]
        fn append_into_empty_table_still_succeeds() {
            let text = "```timer\n```\n###### Timer Log\n| date | duration | comments|\n| ---- | -------- | ------- |\n";
            let table = find_log_table(text, 0)
                .expect("locate")
                .expect("heading present");
            assert!(table.rows.is_empty());

            let updated = append_row(text, table.insert_at, &dated_row("2024-01-01", "00:00:10"));
            assert!(updated.contains("| ---- | -------- | ------- |\n| 2024-01-01 | 00:00:10 |  |"));
        }

        #[test]
        fn built_table_plus_append_yields_exactly_one_matching_row() {
            let text = "```timer\n```\n";
            let block = find_timer_block(text, 0)
                .expect("locate block")
                .expect("fence present");

            let with_table = create_log_table(text, &block, LogStyle::Dated);
            let table = find_log_table(&with_table, block.fence.end)
                .expect("locate")
                .expect("created table present");
            let updated = append_row(
                &with_table,
                table.insert_at,
                &dated_row("2024-01-01", "00:00:10"),
            );

            let relocated = find_log_table(&updated, block.fence.end)
                .expect("relocate")
                .expect("table present");
            assert_eq!(relocated.rows, vec![vec!["2024-01-01", "00:00:10", ""]]);
            assert_eq!(updated.matches("| 2024-01-01 | 00:00:10 |  |").count(), 1);
        }

        #[test]
        fn total_sums_rows_and_tolerates_bad_cells() {
            let text = "```timer\n```\n###### Timer Log\nTotal Time: 0.000\n| Start | Stop | Duration | Comments |\n| ----- | ---- | -------- | ------- |\n| a | b | 1.000 |  |\n| a | b |  |  |\n| a | b | abc |  |\n| a | b | 2.500 |  |\n";
            let table = find_log_table(text, 0)
                .expect("locate")
                .expect("heading present");
            let updated = recompute_total(text, &table);
            assert!(updated.contains("Total Time: 3.500"));
        }

        #[test]
        fn recompute_total_is_idempotent() {
            let text = "###### Timer Log\nTotal Time: 9.999\n| Start | Stop | Duration | Comments |\n| ----- | ---- | -------- | ------- |\n| a | b | 1.250 |  |\n";
            let table = find_log_table(text, 0)
                .expect("locate")
                .expect("heading present");
            let once = recompute_total(text, &table);

            let table = find_log_table(&once, 0)
                .expect("relocate")
                .expect("heading present");
            let twice = recompute_total(&once, &table);
            assert_eq!(once, twice);
            assert!(once.contains("Total Time: 1.250"));
        }

        #[test]
        fn dated_table_total_recompute_is_a_no_op() {
            let text = "###### Timer Log\n| date | duration | comments|\n| ---- | -------- | ------- |\n| 2024-01-01 | 00:05:32 |  |\n";
            let table = find_log_table(text, 0)
                .expect("locate")
                .expect("heading present");
            assert_eq!(recompute_total(text, &table), text);
        }

        #[test]
        fn stamped_identifier_parses_back_verbatim() {
            let text = "```timer\nlog: true\n```\n";
            let block = find_timer_block(text, 0)
                .expect("locate block")
                .expect("fence present");
            let stamped = stamp_timer_uid(text, &block, "abc-123");

            assert!(stamped.contains("log: true\n_timerUID: abc-123\n```"));
            let reparsed = find_timer_block(&stamped, 0)
                .expect("relocate block")
                .expect("fence still present");
            assert_eq!(reparsed.options.timer_uid.as_deref(), Some("abc-123"));
            assert_eq!(reparsed.options.log, Some(true));
        }

        #[test]
        fn stamping_a_bodyless_block_inserts_its_own_line() {
            let text = "```timer```\n";
            let block = find_timer_block(text, 0)
                .expect("locate block")
                .expect("fence present");
            let stamped = stamp_timer_uid(text, &block, "abc");
            assert!(stamped.contains("```timer\n_timerUID: abc\n```"));
        }
    }
}

pub mod stopwatch {
    //! One stopwatch instance per timer block.
    //!
    //! Elapsed time is recomputed from the recorded start on every tick
    //! rather than accumulated by the tick itself, so a delayed or coalesced
    //! refresh can never drift the display.

    use chrono::{Local, NaiveDateTime};
    use std::time::{Duration, Instant};

    /// Cancellable handle to the host's periodic display-refresh task.
    pub trait RefreshHandle {
        fn cancel(&mut self);
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Status {
        Stopped,
        Running,
    }

    /// One finished start/stop cycle, ready to be logged.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FinishedSession {
        pub started: NaiveDateTime,
        pub stopped: NaiveDateTime,
        pub elapsed: Duration,
    }

    /// Elapsed wall-clock breakdown used for display.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ElapsedParts {
        pub days: u64,
        pub hours: u64,
        pub minutes: u64,
        pub seconds: u64,
        pub millis: u32,
    }

    impl ElapsedParts {
        pub fn from_duration(elapsed: Duration) -> Self {
            let total_secs = elapsed.as_secs();
            Self {
                days: total_secs / 86_400,
                hours: (total_secs % 86_400) / 3600,
                minutes: (total_secs % 3600) / 60,
                seconds: total_secs % 60,
                millis: elapsed.subsec_millis(),
            }
        }

        /// Clock rendering; days fold into the hour field.
        pub fn clock(&self, ms: bool) -> String {
            let hours = self.days * 24 + self.hours;
            if ms {
                format!(
                    "{:02}:{:02}:{:02}.{:03}",
                    hours, self.minutes, self.seconds, self.millis
                )
            } else {
                format!("{:02}:{:02}:{:02}", hours, self.minutes, self.seconds)
            }
        }
    }

    /// Stopped/Running state for one timer block. The refresh handle is
    /// owned by this instance alone and is cancelled on every transition
    /// out of Running, so a stale task can never keep ticking alongside a
    /// new one.
    pub struct Stopwatch {
        uid: String,
        started_wall: Option<NaiveDateTime>,
        started_mono: Option<Instant>,
        last_elapsed: Duration,
        refresh: Option<Box<dyn RefreshHandle>>,
    }

    impl std::fmt::Debug for Stopwatch {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("Stopwatch")
                .field("uid", &self.uid)
                .field("status", &self.status())
                .field("started", &self.started_wall)
                .finish()
        }
    }

    impl Stopwatch {
        pub fn new(uid: impl Into<String>) -> Self {
            Self {
                uid: uid.into(),
                started_wall: None,
                started_mono: None,
                last_elapsed: Duration::ZERO,
                refresh: None,
            }
        }

        pub fn uid(&self) -> &str {
            &self.uid
        }

        pub fn status(&self) -> Status {
            if self.started_mono.is_some() {
                Status::Running
            } else {
                Status::Stopped
            }
        }

        pub fn is_running(&self) -> bool {
            matches!(self.status(), Status::Running)
        }

        /// Valid only while stopped; returns whether the transition
        /// happened.
        pub fn start(&mut self) -> bool {
            if self.is_running() {
                return false;
            }
            self.cancel_refresh();
            self.started_wall = Some(Local::now().naive_local());
            self.started_mono = Some(Instant::now());
            true
        }

        /// Arms the periodic refresh for the current running cycle,
        /// cancelling whatever was armed before it. A handle attached while
        /// stopped is cancelled immediately.
        pub fn attach_refresh(&mut self, mut handle: Box<dyn RefreshHandle>) {
            self.cancel_refresh();
            if self.is_running() {
                self.refresh = Some(handle);
            } else {
                handle.cancel();
            }
        }

        /// Valid only while running; returns the finished session.
        pub fn stop(&mut self) -> Option<FinishedSession> {
            let (started, mono) = match (self.started_wall.take(), self.started_mono.take()) {
                (Some(wall), Some(mono)) => (wall, mono),
                _ => return None,
            };
            self.cancel_refresh();
            let elapsed = mono.elapsed();
            self.last_elapsed = elapsed;
            Some(FinishedSession {
                started,
                stopped: Local::now().naive_local(),
                elapsed,
            })
        }

        /// With `continue_running` while running, the start is re-stamped
        /// and the cycle keeps going (elapsed drops to zero, status is
        /// unchanged); otherwise the watch is forced to stopped with its
        /// start cleared.
        pub fn reset(&mut self, continue_running: bool) {
            if continue_running && self.is_running() {
                self.started_wall = Some(Local::now().naive_local());
                self.started_mono = Some(Instant::now());
                return;
            }
            self.cancel_refresh();
            self.started_wall = None;
            self.started_mono = None;
            self.last_elapsed = Duration::ZERO;
        }

        /// Live elapsed while running, the last finished cycle otherwise.
        pub fn elapsed(&self) -> Duration {
            match self.started_mono {
                Some(mono) => mono.elapsed(),
                None => self.last_elapsed,
            }
        }

        pub fn started_at(&self) -> Option<NaiveDateTime> {
            self.started_wall
        }

        /// Monotonic start of the current running cycle, for hosts that
        /// drive their own redraw task.
        pub fn running_since(&self) -> Option<Instant> {
            self.started_mono
        }

        pub fn display(&self, ms: bool) -> String {
            ElapsedParts::from_duration(self.elapsed()).clock(ms)
        }

        fn cancel_refresh(&mut self) {
            if let Some(mut handle) = self.refresh.take() {
                handle.cancel();
            }
        }
    }

    impl Drop for Stopwatch {
        fn drop(&mut self) {
            self.cancel_refresh();
        }
    }

}

pub mod registry {
    //! Reattachment registry: one live stopwatch per persisted identifier.

    use crate::core::TimerId;
    use crate::stopwatch::Stopwatch;
    use std::{cell::RefCell, collections::BTreeMap, rc::Rc};

    /// Shared single-threaded handle to one stopwatch.
    pub type SharedStopwatch = Rc<RefCell<Stopwatch>>;

    /// Result of attaching a block to the registry.
    pub struct Attached {
        pub stopwatch: SharedStopwatch,
        /// Present when the block carried no identifier and one was minted;
        /// the caller must stamp it back into the block body.
        pub minted: Option<TimerId>,
    }

    /// Maps persisted `_timerUID` tokens to live stopwatch instances so that
    /// re-rendering a block reattaches instead of resetting. Entries die
    /// with the registry.
    #[derive(Default)]
    pub struct TimerRegistry {
        timers: BTreeMap<String, SharedStopwatch>,
    }

    impl TimerRegistry {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn len(&self) -> usize {
            self.timers.len()
        }

        pub fn is_empty(&self) -> bool {
            self.timers.is_empty()
        }

        pub fn get(&self, uid: &str) -> Option<SharedStopwatch> {
            self.timers.get(uid).cloned()
        }

        /// Sorted identifiers of all live entries.
        pub fn uids(&self) -> Vec<String> {
            self.timers.keys().cloned().collect()
        }

        /// Reattaches to the identifier's live state when one exists (a
        /// running watch keeps running across re-renders), creates a fresh
        /// stopped instance under a known identifier otherwise, and mints a
        /// new identifier when the block has none yet.
        pub fn get_or_create(&mut self, uid: Option<&str>) -> Attached {
            match uid {
                Some(uid) => {
                    if let Some(existing) = self.timers.get(uid) {
                        return Attached {
                            stopwatch: Rc::clone(existing),
                            minted: None,
                        };
                    }
                    let created: SharedStopwatch = Rc::new(RefCell::new(Stopwatch::new(uid)));
                    self.timers.insert(uid.to_string(), Rc::clone(&created));
                    Attached {
                        stopwatch: created,
                        minted: None,
                    }
                }
                None => {
                    let minted = TimerId::new();
                    let key = minted.to_string();
                    let created: SharedStopwatch =
                        Rc::new(RefCell::new(Stopwatch::new(key.clone())));
                    self.timers.insert(key, Rc::clone(&created));
                    Attached {
                        stopwatch: created,
                        minted: Some(minted),
                    }
                }
            }
        }

        pub fn remove(&mut self, uid: &str) -> Option<SharedStopwatch> {
            self.timers.remove(uid)
        }

        /// Drops every registry handle, as extension unload does. A
        /// stopwatch with no other holders is dropped here, which cancels
        /// its refresh task.
        pub fn clear(&mut self) {
            self.timers.clear();
        }
    }

}

pub mod storage {
    //! Host-boundary traits: whole-document note I/O and settings
    //! persistence.

    use crate::core::TimerConfig;
    use anyhow::{Context, Result};
    use std::fs;
    use std::path::{Path, PathBuf};

    /// Whole-text document access. Every mutation is a full replacement
    /// write.
    pub trait NoteStore {
        fn read_note(&self, path: &Path) -> Result<String>;
        fn write_note(&self, path: &Path, text: &str) -> Result<()>;
    }

    /// Flat settings object persistence, merged over defaults on load.
    pub trait SettingsStore {
        fn load_config(&self) -> Result<TimerConfig>;
        fn save_config(&self, config: &TimerConfig) -> Result<()>;
    }

    /// Notes as plain files on disk.
    pub struct FsNoteStore;

    impl NoteStore for FsNoteStore {
        fn read_note(&self, path: &Path) -> Result<String> {
            fs::read_to_string(path).with_context(|| format!("reading {:?}", path))
        }

        fn write_note(&self, path: &Path, text: &str) -> Result<()> {
            fs::write(path, text.as_bytes()).with_context(|| format!("writing {:?}", path))
        }
    }

    /// Settings as one JSON file; a missing file yields the defaults.
    pub struct JsonSettingsStore {
        pub path: PathBuf,
    }

    impl JsonSettingsStore {
        pub fn new(path: impl Into<PathBuf>) -> Self {
            Self { path: path.into() }
        }
    }

    impl SettingsStore for JsonSettingsStore {
        fn load_config(&self) -> Result<TimerConfig> {
            if !self.path.exists() {
                return Ok(TimerConfig::default());
            }
            let text = fs::read_to_string(&self.path)
                .with_context(|| format!("reading settings {:?}", self.path))?;
            serde_json::from_str(&text)
                .with_context(|| format!("parsing settings {:?}", self.path))
        }

        fn save_config(&self, config: &TimerConfig) -> Result<()> {
            let json = serde_json::to_string_pretty(config).context("serializing settings")?;
            fs::write(&self.path, json.as_bytes())
                .with_context(|| format!("writing settings {:?}", self.path))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::{FsNoteStore, JsonSettingsStore, NoteStore, SettingsStore};
        use crate::core::TimerConfig;
        use std::fs;

        #[test]
        fn note_round_trip_preserves_text() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = tmp.path().join("note.md");
            let store = FsNoteStore;

            store
                .write_note(&path, "```timer\n```\nbody text\n")
                .expect("write note");
            let read = store.read_note(&path).expect("read note");
            assert_eq!(read, "```timer\n```\nbody text\n");
        }

        #[test]
        fn missing_settings_file_yields_defaults() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let store = JsonSettingsStore::new(tmp.path().join("absent.json"));
            let config = store.load_config().expect("load settings");
            assert_eq!(config, TimerConfig::default());
        }

        #[test]
        fn partial_settings_file_merges_over_defaults() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = tmp.path().join("settings.json");
            fs::write(&path, r#"{ "auto_log": true }"#).expect("seed settings");

            let store = JsonSettingsStore::new(&path);
            let config = store.load_config().expect("load settings");
            assert!(config.auto_log);
            assert!(config.ms_display);
        }

        #[test]
        fn saved_settings_load_back_equal() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let store = JsonSettingsStore::new(tmp.path().join("settings.json"));
            let mut config = TimerConfig::default();
            config.auto_log = true;
            config.date_format = "%d.%m.%Y".to_string();

            store.save_config(&config).expect("save settings");
            let loaded = store.load_config().expect("load settings");
            assert_eq!(loaded, config);
        }
    }
}

pub mod session {
    //! The logging flow that follows a stopwatch stop: find the block's log
    //! table (creating it when absent), splice in the row, and refresh the
    //! running total. Each logical step issues its own whole-document write.
    //!
    //! Two blocks stopping at the same instant can still compute offsets
    //! from stale snapshots of the same note. The block-scoped table search
    //! keeps them on their own tables; a document-wide guard is deliberately
    //! left out (single user, one block at a time).

    use crate::core::{LogRow, LogStyle, TimerBlock, TimerConfig};
    use crate::locate::find_log_table;
    use crate::mutate::{append_row, create_log_table, recompute_total, stamp_timer_uid, sum_durations};
    use crate::stopwatch::FinishedSession;
    use crate::storage::NoteStore;
    use crate::table::{format_duration_clock, format_duration_hours, format_marker};
    use anyhow::{Context, Result};
    use std::path::Path;

    /// What a completed log pass did to the note.
    #[derive(Debug, Clone, PartialEq)]
    pub struct LogOutcome {
        pub created_table: bool,
        /// The rendered row line, without its leading line break.
        pub row: String,
        /// Recomputed duration total, for interval tables.
        pub total: Option<f64>,
    }

    /// Renders the row for one finished session under the effective config.
    pub fn build_row(session: &FinishedSession, config: &TimerConfig) -> LogRow {
        match config.log_style {
            LogStyle::Dated => LogRow {
                start: format_marker(session.started, &config.date_format, config.date_linking),
                stop: None,
                duration: format_duration_clock(session.elapsed, config.ms_display),
            },
            LogStyle::Interval => LogRow {
                start: format_marker(session.started, &config.date_format, config.date_linking),
                stop: Some(format_marker(
                    session.stopped,
                    &config.date_format,
                    config.date_linking,
                )),
                duration: format_duration_hours(session.elapsed),
            },
        }
    }

    /// Appends one session row to the block's log table, creating the table
    /// when absent, and recomputes the total for interval tables.
    pub fn log_session(
        store: &dyn NoteStore,
        path: &Path,
        block: &TimerBlock,
        config: &TimerConfig,
        session: &FinishedSession,
    ) -> Result<LogOutcome> {
        let row = build_row(session, config);
        append_log_row(store, path, block, config, &row)
    }

    /// Row-level variant for hosts that already formatted a duration.
    pub fn append_log_row(
        store: &dyn NoteStore,
        path: &Path,
        block: &TimerBlock,
        config: &TimerConfig,
        row: &LogRow,
    ) -> Result<LogOutcome> {
        let mut text = store.read_note(path)?;

        let mut created_table = false;
        if find_log_table(&text, block.fence.end)?.is_none() {
            text = create_log_table(&text, block, config.log_style);
            store.write_note(path, &text)?;
            created_table = true;
        }

        let table = find_log_table(&text, block.fence.end)?
            .context("log table vanished between creation and append")?;
        text = append_row(&text, table.insert_at, row);
        store.write_note(path, &text)?;

        let total = match find_log_table(&text, block.fence.end)? {
            Some(table) if table.total_line.is_some() => {
                let rewritten = recompute_total(&text, &table);
                store.write_note(path, &rewritten)?;
                Some(sum_durations(&table.rows))
            }
            _ => None,
        };

        Ok(LogOutcome {
            created_table,
            row: row.render().trim_start().to_string(),
            total,
        })
    }

    /// One-time identifier stamping, a mutation distinct from logging.
    pub fn persist_identifier(
        store: &dyn NoteStore,
        path: &Path,
        block: &TimerBlock,
        uid: &str,
    ) -> Result<()> {
        let text = store.read_note(path)?;
        let stamped = stamp_timer_uid(&text, block, uid);
        store.write_note(path, &stamped)
    }

}

pub use locate::{find_log_table, find_timer_block, find_timer_blocks, next_data_row_start};
pub use session::{append_log_row, log_session, persist_identifier};
pub use table::build_log_table_text;
