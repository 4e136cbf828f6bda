//! Page/section scanner for markdown-converted driver reports.
//!
//! The scanner is a small state object fed one line at a time. Each line
//! yields the next state, at most one finished page, and a per-line outcome;
//! unparseable dates or unrecognised headings are diagnostics, not aborts.

use std::collections::HashMap;

use chrono::NaiveDate;
use feedstock_core::{NarrativePageRecord, ProductCategory};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::dates::{parse_loose_date, DateParseError};

pub const PAGE_BREAK: &str = "-----";

/// Years accepted in a date heading.
pub const DATE_YEARS: std::ops::Range<i32> = 2015..2035;

const CONTACT_WINDOW: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanPhase {
    AwaitPageStart,
    InPageHeaderSearch,
    InPageDateSearch,
    PageClosed,
}

/// How pages without their own date heading are dated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatePolicy {
    /// Keep whatever the page itself carried (possibly nothing).
    PerPage,
    /// Document-level fill. When every page is dated the dates stand; when
    /// only some are, every page takes the first date found; when none is,
    /// no page is dated and every header becomes `Error{row}`.
    #[default]
    InheritFirst,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScannerState {
    page: u32,
    header: Option<ProductCategory>,
    fallback: Option<ProductCategory>,
    date: Option<NaiveDate>,
    content_lines: usize,
}

impl ScannerState {
    pub fn page(&self) -> u32 {
        self.page
    }

    /// Phase of the current page. Header and date are searched for together;
    /// the phase names the first one still open.
    pub fn phase(&self) -> ScanPhase {
        if self.page == 0 {
            ScanPhase::AwaitPageStart
        } else if self.header.is_none() {
            ScanPhase::InPageHeaderSearch
        } else if self.date.is_none() {
            ScanPhase::InPageDateSearch
        } else {
            ScanPhase::PageClosed
        }
    }

    fn open_page(page: u32) -> Self {
        Self {
            page,
            ..Self::default()
        }
    }

    fn close(&self) -> PageDraft {
        PageDraft {
            page: self.page,
            header: self.header.or(self.fallback),
            date: self.date,
        }
    }
}

/// A finished page before document-level post-processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageDraft {
    pub page: u32,
    pub header: Option<ProductCategory>,
    pub date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEffect {
    PageOpened(u32),
    Header(ProductCategory),
    FallbackHeader(ProductCategory),
    Date(NaiveDate),
    Content,
    Blank,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LineError {
    #[error("drivers heading names no known product: {0:?}")]
    UnknownDriversHeading(String),
    #[error("date heading {text:?} did not parse: {source}")]
    UnparseableDate {
        text: String,
        #[source]
        source: DateParseError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub state: ScannerState,
    pub closed: Option<PageDraft>,
    pub outcome: Result<LineEffect, LineError>,
}

/// Pure per-line transition.
pub fn step(state: ScannerState, line: &str) -> Transition {
    let is_break = line.starts_with(PAGE_BREAK);

    // A break on the first line closes an empty page 1.
    if state.page == 0 {
        return step(ScannerState::open_page(1), line);
    }

    if is_break {
        let next = state.page + 1;
        return Transition {
            closed: Some(state.close()),
            state: ScannerState::open_page(next),
            outcome: Ok(LineEffect::PageOpened(next)),
        };
    }

    let mut state = state;
    if line.trim().is_empty() {
        return Transition {
            state,
            closed: None,
            outcome: Ok(LineEffect::Blank),
        };
    }
    state.content_lines += 1;

    let mut outcome = Ok(LineEffect::Content);

    if state.header.is_none() && line.starts_with("# ") && line.contains("DRIVERS") {
        let compact = line.replace(' ', "").to_uppercase();
        outcome = match ProductCategory::detect_in_heading(&compact) {
            Some(category) => {
                state.header = Some(category);
                Ok(LineEffect::Header(category))
            }
            None => Err(LineError::UnknownDriversHeading(line.to_string())),
        };
    } else if state.header.is_none() {
        // The last anchor on the page wins.
        if let Some(category) = contact_anchor(line) {
            state.fallback = Some(category);
            outcome = Ok(LineEffect::FallbackHeader(category));
        }
    }

    if state.date.is_none() && is_dated_heading(line) {
        let text = line.trim_start_matches('#').trim();
        outcome = match parse_loose_date(text) {
            Ok(date) => {
                state.date = Some(date);
                Ok(LineEffect::Date(date))
            }
            Err(source) => Err(LineError::UnparseableDate {
                text: text.to_string(),
                source,
            }),
        };
    }

    Transition {
        state,
        closed: None,
        outcome,
    }
}

/// "For additional <X> information" or "# RTi <X> Outlook and Suggested" in
/// the first 40 characters, with emphasis markers removed.
fn contact_anchor(line: &str) -> Option<ProductCategory> {
    let cleaned = line.replace("**", "").replace('_', "");
    let window: String = cleaned.chars().take(CONTACT_WINDOW).collect();
    ProductCategory::ALL.into_iter().find(|category| {
        category.contact_names().iter().any(|name| {
            window.contains(&format!("For additional {name} information"))
                || window.contains(&format!("# RTi {name} Outlook and Suggested"))
        })
    })
}

/// Level 3-6 heading holding a plausible report year.
fn is_dated_heading(line: &str) -> bool {
    let level = line.chars().take_while(|c| *c == '#').count();
    if !(3..=6).contains(&level) || !line[level..].starts_with(' ') {
        return false;
    }
    DATE_YEARS
        .clone()
        .any(|year| line.contains(&year.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineDiagnostic {
    pub line_no: usize,
    pub error: LineError,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NarrativeScan {
    pub records: Vec<NarrativePageRecord>,
    pub diagnostics: Vec<LineDiagnostic>,
}

/// Scans a whole document into one record per page.
pub fn scan_document(markdown: &str, pdf_name: &str, policy: DatePolicy) -> NarrativeScan {
    let mut state = ScannerState::default();
    let mut drafts = Vec::new();
    let mut diagnostics = Vec::new();

    for (line_no, line) in markdown.lines().enumerate() {
        let transition = step(state, line);
        state = transition.state;
        drafts.extend(transition.closed);
        if let Err(error) = transition.outcome {
            debug!(pdf_name, line_no, %error, "line diagnostic");
            diagnostics.push(LineDiagnostic { line_no, error });
        }
    }

    // The page opened by the last break (or by EOF on an empty document) only
    // counts when it holds something.
    if state.page > 0 && state.content_lines > 0 {
        drafts.push(state.close());
    }

    NarrativeScan {
        records: finish_records(drafts, pdf_name, policy),
        diagnostics,
    }
}

/// Resolves headers and dates across the document. Headers claimed by more
/// than one page, or by none, become `Error{row}`; dates follow `policy`.
pub fn finish_records(
    drafts: Vec<PageDraft>,
    pdf_name: &str,
    policy: DatePolicy,
) -> Vec<NarrativePageRecord> {
    let mut counts: HashMap<ProductCategory, usize> = HashMap::new();
    for category in drafts.iter().filter_map(|d| d.header) {
        *counts.entry(category).or_default() += 1;
    }
    let first_date = drafts.iter().find_map(|d| d.date);
    let all_dated = drafts.iter().all(|d| d.date.is_some());
    let undatable = policy == DatePolicy::InheritFirst && first_date.is_none();

    drafts
        .into_iter()
        .enumerate()
        .map(|(row, draft)| {
            let header = match draft.header {
                Some(category) if !undatable && counts.get(&category) == Some(&1) => {
                    category.drivers_label()
                }
                _ => format!("Error{row}"),
            };
            let date = match policy {
                DatePolicy::PerPage => draft.date,
                DatePolicy::InheritFirst if all_dated => draft.date,
                DatePolicy::InheritFirst => first_date,
            };
            NarrativePageRecord {
                page: draft.page,
                header,
                date,
                pdf_name: pdf_name.to_string(),
            }
        })
        .collect()
}
