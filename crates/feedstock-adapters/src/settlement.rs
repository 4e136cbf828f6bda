//! Section location and row tokenisation for CME settlement reports.

use feedstock_core::{DatasetKey, ExtractedRow, SectionBounds, FULL_COLUMN_COUNT};
use thiserror::Error;

/// Footer anchor closing every dataset section.
pub const SECTION_FOOTER: &str = "TOTAL";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    Header,
    Footer,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExtractError {
    #[error("section {section_key:?} not found: missing {missing:?} line")]
    SectionNotFound { section_key: String, missing: Anchor },
}

/// Padding applied to short rows: observed token count -> `(insert_after_index, pad_count)`.
#[derive(Debug)]
pub struct ColumnRepairRule {
    entries: &'static [(usize, &'static [(usize, usize)])],
}

impl ColumnRepairRule {
    pub const fn new(entries: &'static [(usize, &'static [(usize, usize)])]) -> Self {
        Self { entries }
    }

    pub fn padding_for(&self, observed: usize) -> Option<&'static [(usize, usize)]> {
        if observed >= FULL_COLUMN_COUNT {
            return None;
        }
        self.entries
            .iter()
            .find(|(count, _)| *count == observed)
            .map(|(_, padding)| *padding)
    }

    /// Inserts empty fields after the listed token indices. Complete rows and
    /// counts without an entry come back untouched.
    pub fn repair(&self, tokens: Vec<String>) -> Vec<String> {
        let Some(padding) = self.padding_for(tokens.len()) else {
            return tokens;
        };
        let mut out = Vec::with_capacity(FULL_COLUMN_COUNT);
        for (i, token) in tokens.into_iter().enumerate() {
            out.push(token);
            for &(after, count) in padding {
                if after == i {
                    out.extend(std::iter::repeat(String::new()).take(count));
                }
            }
        }
        out
    }
}

/// Settlement sections drop the trailing volume/interest figures for thinly
/// traded months; the gaps sit after the point-change and volume columns.
static SETTLEMENT_REPAIR: ColumnRepairRule =
    ColumnRepairRule::new(&[(10, &[(7, 1)]), (9, &[(6, 1), (7, 1)]), (8, &[(6, 1), (7, 2)])]);

pub fn repair_rule(key: DatasetKey) -> &'static ColumnRepairRule {
    match key {
        DatasetKey::WtiCrudeOil
        | DatasetKey::MontBelvieuPropane
        | DatasetKey::BrentCrudeOil
        | DatasetKey::MontBelvieuEthane
        | DatasetKey::CadUsd
        | DatasetKey::EurUsd
        | DatasetKey::HenryHubNaturalGas => &SETTLEMENT_REPAIR,
    }
}

/// First line containing `header_token` opens the section; the first later
/// line containing `footer_token` closes it.
pub fn find_section(
    blob: &str,
    header_token: &str,
    footer_token: &str,
) -> Result<SectionBounds, ExtractError> {
    let not_found = |missing| ExtractError::SectionNotFound {
        section_key: header_token.to_string(),
        missing,
    };

    let mut lines = blob.lines().enumerate();
    let start_line = lines
        .find(|(_, line)| line.contains(header_token))
        .map(|(i, _)| i)
        .ok_or_else(|| not_found(Anchor::Header))?;
    let end_line = lines
        .find(|(_, line)| line.contains(footer_token))
        .map(|(i, _)| i)
        .ok_or_else(|| not_found(Anchor::Footer))?;

    Ok(SectionBounds {
        start_line,
        end_line,
        section_key: header_token.to_string(),
    })
}

pub fn extract_rows(blob: &str, bounds: &SectionBounds, key: DatasetKey) -> Vec<ExtractedRow> {
    let rule = repair_rule(key);
    blob.lines()
        .skip(bounds.start_line + 1)
        .take(bounds.body_len())
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let tokens = line.split_whitespace().map(str::to_string).collect();
            ExtractedRow::new(rule.repair(tokens))
        })
        .collect()
}

/// Locates the dataset's section by its report title and extracts its rows.
pub fn extract_dataset(blob: &str, key: DatasetKey) -> Result<Vec<ExtractedRow>, ExtractError> {
    let bounds = find_section(blob, key.report_title(), SECTION_FOOTER)?;
    Ok(extract_rows(blob, &bounds, key))
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = "\
CME GROUP SETTLEMENTS
BZ Brent Crude Oil Last Day Financial Futures
JAN25  73.10  73.90  72.80  73.52B  73.45  +.33  4210  73.12  3980  51230
FEB25  72.95  73.40  72.70  73.20  73.18  +.30  1120  72.88  15230
MAR25  72.60  72.60  72.60  72.60  72.81  +.27  72.54  9810

APR25  72.40  72.40  72.40  72.40  72.50  72.22  7700
TOTAL  5330  176000
NG Henry Hub Natural Gas Futures
";

    #[test]
    fn section_bounds_are_ordered_and_stable() {
        let first = find_section(REPORT, DatasetKey::BrentCrudeOil.report_title(), SECTION_FOOTER)
            .expect("brent section");
        let second = find_section(REPORT, DatasetKey::BrentCrudeOil.report_title(), SECTION_FOOTER)
            .expect("brent section");
        assert!(first.start_line < first.end_line);
        assert_eq!(first, second);
        assert_eq!((first.start_line, first.end_line), (1, 7));
    }

    #[test]
    fn missing_anchors_are_reported() {
        let err = find_section(REPORT, "EC Euro/U.S. Dollar (EUR/USD) Futures", SECTION_FOOTER)
            .unwrap_err();
        assert!(matches!(err, ExtractError::SectionNotFound { missing: Anchor::Header, .. }));

        let err = find_section(REPORT, DatasetKey::HenryHubNaturalGas.report_title(), SECTION_FOOTER)
            .unwrap_err();
        assert!(matches!(err, ExtractError::SectionNotFound { missing: Anchor::Footer, .. }));
    }

    #[test]
    fn short_rows_are_padded_to_full_width() {
        let rows = extract_dataset(REPORT, DatasetKey::BrentCrudeOil).expect("rows");
        assert_eq!(rows.len(), 4, "blank line is skipped");
        assert!(rows.iter().all(|r| r.len() == FULL_COLUMN_COUNT));

        assert_eq!(rows[0].field("SETT"), Some("73.45"));
        assert_eq!(rows[1].field("PREV_DAY_SETT"), Some(""));
        assert_eq!(rows[1].field("PREV_DAY_INT"), Some("15230"));
        assert_eq!(rows[2].field("ACT_EST_VOL"), Some(""));
        assert_eq!(rows[3].fields[7..], ["", "7700", "", ""]);
    }

    #[test]
    fn complete_and_unknown_widths_pass_through() {
        let rule = repair_rule(DatasetKey::EurUsd);
        let wide: Vec<String> = (0..12).map(|i| i.to_string()).collect();
        assert_eq!(rule.repair(wide.clone()), wide);

        let short: Vec<String> = vec!["DEC24".into(), "1.05".into()];
        assert_eq!(rule.repair(short.clone()), short);
    }
}
