//! TODO-marker cycling for outline blocks.
//!
//! The core is pure: it takes block texts plus the user's preferences and returns the
//! rewritten texts. Hosts (editors, the bundled CLI) own selection, loading, and saving
//! through the `host::BlockHost` seam.

pub mod core {
    use chrono::{NaiveDate, NaiveTime};
    use serde::{Deserialize, Serialize};
    use std::{fmt, str::FromStr};

    /* ------------------------------- Markers ------------------------------- */

    /// Leading status token of a block. The empty marker is `None` at use sites.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "UPPERCASE")]
    pub enum Marker {
        Todo,
        Doing,
        Done,
        Later,
        Now,
    }

    impl Marker {
        /// Union of both styles' tokens, longest first. Recognition never depends on the
        /// preferred style.
        pub const ALL: [Marker; 5] = [
            Marker::Doing,
            Marker::Later,
            Marker::Todo,
            Marker::Done,
            Marker::Now,
        ];

        pub fn as_str(self) -> &'static str {
            match self {
                Marker::Todo => "TODO",
                Marker::Doing => "DOING",
                Marker::Done => "DONE",
                Marker::Later => "LATER",
                Marker::Now => "NOW",
            }
        }
    }

    impl fmt::Display for Marker {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    /* -------------------------------- Styles -------------------------------- */

    const TODO_SEQUENCE: [Option<Marker>; 4] = [
        None,
        Some(Marker::Todo),
        Some(Marker::Doing),
        Some(Marker::Done),
    ];

    const LATER_SEQUENCE: [Option<Marker>; 4] = [
        None,
        Some(Marker::Later),
        Some(Marker::Now),
        Some(Marker::Done),
    ];

    /// Marker vocabulary chosen by the user. Defaults to `LATER`, like the editor it serves.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(try_from = "String", into = "String")]
    pub enum Style {
        Todo,
        #[default]
        Later,
    }

    impl Style {
        /// Position of the in-progress marker (`DOING`/`NOW`) in every sequence.
        pub const ACTIVE_INDEX: usize = 2;

        /// Ordered cycle; position 0 is the empty marker.
        pub fn sequence(self) -> &'static [Option<Marker>; 4] {
            match self {
                Style::Todo => &TODO_SEQUENCE,
                Style::Later => &LATER_SEQUENCE,
            }
        }

        pub fn start_marker(self) -> Marker {
            match self {
                Style::Todo => Marker::Todo,
                Style::Later => Marker::Later,
            }
        }

        pub fn active_marker(self) -> Marker {
            match self {
                Style::Todo => Marker::Doing,
                Style::Later => Marker::Now,
            }
        }

        pub fn as_str(self) -> &'static str {
            match self {
                Style::Todo => "TODO",
                Style::Later => "LATER",
            }
        }
    }

    impl fmt::Display for Style {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    impl FromStr for Style {
        type Err = DomainError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            match s.trim().to_ascii_uppercase().as_str() {
                "TODO" => Ok(Style::Todo),
                "LATER" => Ok(Style::Later),
                _ => Err(DomainError::UnknownStyle(s.to_string())),
            }
        }
    }

    impl TryFrom<String> for Style {
        type Error = DomainError;

        fn try_from(value: String) -> Result<Self, Self::Error> {
            value.parse()
        }
    }

    impl From<Style> for String {
        fn from(style: Style) -> Self {
            style.as_str().to_string()
        }
    }

    /* ---------------------------- Value Objects ---------------------------- */

    /// Calendar unit of a repeat cookie (`y`, `m`, `w`, `d`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum RepeatUnit {
        Years,
        Months,
        Weeks,
        Days,
    }

    impl RepeatUnit {
        pub fn from_char(c: char) -> Option<Self> {
            match c {
                'y' => Some(RepeatUnit::Years),
                'm' => Some(RepeatUnit::Months),
                'w' => Some(RepeatUnit::Weeks),
                'd' => Some(RepeatUnit::Days),
                _ => None,
            }
        }

        pub fn as_char(self) -> char {
            match self {
                RepeatUnit::Years => 'y',
                RepeatUnit::Months => 'm',
                RepeatUnit::Weeks => 'w',
                RepeatUnit::Days => 'd',
            }
        }
    }

    /// `.+Nu` repeat cookie: reschedule `count` units after the current date.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct RepeatPeriod {
        pub count: u32,
        pub unit: RepeatUnit,
    }

    impl fmt::Display for RepeatPeriod {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, ".+{}{}", self.count, self.unit.as_char())
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "UPPERCASE")]
    pub enum AnnotationKind {
        Scheduled,
        Deadline,
    }

    impl AnnotationKind {
        pub fn keyword(self) -> &'static str {
            match self {
                AnnotationKind::Scheduled => "SCHEDULED",
                AnnotationKind::Deadline => "DEADLINE",
            }
        }
    }

    /// Byte range into the block text the value was parsed from.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct SourceRange {
        pub start: usize,
        pub end: usize,
    }

    /// A `SCHEDULED:`/`DEADLINE:` timestamp found in a block.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Annotation {
        pub kind: AnnotationKind,
        pub date: NaiveDate,
        /// Day-of-week label as written; never checked against `date`.
        pub day_of_week: String,
        /// Clock time, carried through untouched.
        pub time: Option<NaiveTime>,
        pub repeat: Option<RepeatPeriod>,
        /// Covers `YYYY-MM-DD DOW`, the part rescheduling replaces.
        pub date_range: SourceRange,
    }

    impl Annotation {
        pub fn is_recurring(&self) -> bool {
            self.repeat.is_some()
        }
    }

    /// At most one annotation of each kind per block.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Annotations {
        pub scheduled: Option<Annotation>,
        pub deadline: Option<Annotation>,
    }

    impl Annotations {
        pub fn iter(&self) -> impl Iterator<Item = &Annotation> {
            self.scheduled.iter().chain(self.deadline.iter())
        }

        /// A repeat period on either kind makes the whole block recurring.
        pub fn is_recurring(&self) -> bool {
            self.iter().any(Annotation::is_recurring)
        }
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum DomainError {
        #[error("{date} shifted by {period} leaves the supported calendar range")]
        DateOutOfRange {
            date: NaiveDate,
            period: RepeatPeriod,
        },
        #[error("unknown TODO style {0:?} (expected TODO or LATER)")]
        UnknownStyle(String),
    }

}

pub mod marker {
    //! Reading and rewriting the leading marker token of a block.

    use crate::core::Marker;
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::tag,
        character::complete::multispace1,
        combinator::{eof, peek},
        error::{VerboseError, VerboseErrorKind},
        sequence::terminated,
    };

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /// A marker token at position 0, followed by whitespace or the end of the text.
    fn marker_token(i: &str) -> PResult<'_, Marker> {
        for marker in Marker::ALL {
            let attempt: PResult<'_, &str> =
                terminated(tag(marker.as_str()), peek(alt((multispace1, eof))))(i);
            if let Ok((rest, _)) = attempt {
                return Ok((rest, marker));
            }
        }
        Err(nom::Err::Error(VerboseError {
            errors: vec![(i, VerboseErrorKind::Context("marker"))],
        }))
    }

    pub fn extract_marker(text: &str) -> Option<Marker> {
        marker_token(text).ok().map(|(_, marker)| marker)
    }

    /// Return `text` with its leading marker replaced by `new_marker`.
    ///
    /// The marker always owns exactly one separator: an unmarked text gets `"<new> "`
    /// prepended, and a marked text loses its token plus one following space or tab.
    /// Whatever the user typed after that separator is kept as is.
    pub fn rewrite_marker(text: &str, new_marker: Option<Marker>) -> String {
        let rest = match marker_token(text) {
            Err(_) => text,
            Ok((rest, _)) => rest.strip_prefix([' ', '\t']).unwrap_or(rest),
        };
        match new_marker {
            Some(marker) => format!("{marker} {rest}"),
            None => rest.to_string(),
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn extracts_markers_from_both_styles() {
            assert_eq!(extract_marker("TODO buy milk"), Some(Marker::Todo));
            assert_eq!(extract_marker("DOING x"), Some(Marker::Doing));
            assert_eq!(extract_marker("LATER x\nmore"), Some(Marker::Later));
            assert_eq!(extract_marker("NOW"), Some(Marker::Now));
            assert_eq!(extract_marker("DONE\tx"), Some(Marker::Done));
        }

        #[test]
        fn ignores_unmarked_and_glued_tokens() {
            assert_eq!(extract_marker("foobar"), None);
            assert_eq!(extract_marker(""), None);
            assert_eq!(extract_marker("NOWHERE to go"), None);
            assert_eq!(extract_marker("TODOS are fun"), None);
            assert_eq!(extract_marker(" TODO indented"), None);
            assert_eq!(extract_marker("todo lower"), None);
        }

        #[test]
        fn prepends_to_unmarked_text() {
            assert_eq!(rewrite_marker("foobar", Some(Marker::Todo)), "TODO foobar");
            assert_eq!(rewrite_marker("foobar", None), "foobar");
            assert_eq!(rewrite_marker("", Some(Marker::Later)), "LATER ");
            assert_eq!(rewrite_marker("\nbody", Some(Marker::Todo)), "TODO \nbody");
        }

        #[test]
        fn leading_blanks_of_unmarked_text_survive() {
            for text in [" foo", "\tfoo"] {
                let once = rewrite_marker(text, Some(Marker::Todo));
                assert_eq!(once, format!("TODO {text}"));
                assert_eq!(rewrite_marker(&once, Some(Marker::Todo)), once);
                let doing = rewrite_marker(&once, Some(Marker::Doing));
                assert_eq!(doing, format!("DOING {text}"));
                assert_eq!(rewrite_marker(&doing, None), text);
            }
        }

        #[test]
        fn replaces_existing_marker() {
            assert_eq!(
                rewrite_marker("TODO foobar", Some(Marker::Doing)),
                "DOING foobar"
            );
            assert_eq!(rewrite_marker("DONE  foobar", None), " foobar");
            assert_eq!(rewrite_marker("NOW\tfoobar", Some(Marker::Done)), "DONE foobar");
            assert_eq!(rewrite_marker("DONE", None), "");
            assert_eq!(rewrite_marker("DONE ", None), "");
            assert_eq!(rewrite_marker("TODO", Some(Marker::Doing)), "DOING ");
        }

        #[test]
        fn keeps_following_lines_intact() {
            let text = "LATER foobar\nSCHEDULED: <2000-01-01 Sat .+73y>";
            assert_eq!(
                rewrite_marker(text, Some(Marker::Now)),
                "NOW foobar\nSCHEDULED: <2000-01-01 Sat .+73y>"
            );
            assert_eq!(
                rewrite_marker("TODO\nbody", Some(Marker::Done)),
                "DONE \nbody"
            );
        }

        #[test]
        fn removing_marker_keeps_blank_first_line() {
            assert_eq!(rewrite_marker("TODO\nbody", None), "\nbody");
            assert_eq!(rewrite_marker("TODO \nbody", None), "\nbody");
            assert_eq!(rewrite_marker("\nbody", Some(Marker::Todo)), "TODO \nbody");
        }

        #[test]
        fn rewrite_is_idempotent() {
            for text in ["foobar", "TODO foobar", "NOW  x\ny", "DONE", "", " foo", "\tfoo", "\nfoo"] {
                let once = rewrite_marker(text, Some(Marker::Later));
                let twice = rewrite_marker(&once, Some(Marker::Later));
                assert_eq!(once, twice, "not idempotent for {text:?}");
            }
        }
    }
}

pub mod annotation {
    //! `SCHEDULED:`/`DEADLINE:` timestamp parsing built on `nom`.
    //!
    //! Grammar: `KIND: <YYYY-MM-DD DOW[ HH:MM][ .+Nu]>` with `u` one of `y m w d`.
    //! Anything that does not match the whole grammar is treated as absent.

    use crate::core::*;
    use chrono::{NaiveDate, NaiveTime};
    use nom::{
        IResult,
        bytes::complete::{tag, take_while, take_while1},
        character::complete::{anychar, char, digit1, space0, space1},
        combinator::{map_opt, map_res, opt},
        error::{VerboseError, VerboseErrorKind},
        sequence::{preceded, tuple},
    };

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /* ------------------------ Public entry points ------------------------ */

    pub fn parse_annotations(text: &str) -> Annotations {
        Annotations {
            scheduled: find_annotation(text, AnnotationKind::Scheduled),
            deadline: find_annotation(text, AnnotationKind::Deadline),
        }
    }

    /// First occurrence of `kind` in `text` that parses completely.
    pub fn find_annotation(text: &str, kind: AnnotationKind) -> Option<Annotation> {
        text.match_indices(kind.keyword())
            .find_map(|(offset, _)| annotation_at(text, offset, kind))
    }

    fn annotation_at(text: &str, offset: usize, kind: AnnotationKind) -> Option<Annotation> {
        let (_, parsed) = parse_annotation(&text[offset..], kind).ok()?;
        Some(Annotation {
            kind,
            date: parsed.date,
            day_of_week: parsed.day_of_week.to_string(),
            time: parsed.time,
            repeat: parsed.repeat,
            date_range: range_from(text.len(), parsed.date_from, parsed.date_to),
        })
    }

    /* ------------------------------- Utils ------------------------------- */

    fn range_from(base_len: usize, before: &str, after: &str) -> SourceRange {
        let start = base_len - before.len();
        let end = base_len - after.len();
        SourceRange { start, end }
    }

    /* ----------------------------- Timestamps ----------------------------- */

    struct Parsed<'a> {
        date: NaiveDate,
        day_of_week: &'a str,
        time: Option<NaiveTime>,
        repeat: Option<RepeatPeriod>,
        /// Input remaining at the date, and right after the day-of-week.
        date_from: &'a str,
        date_to: &'a str,
    }

    fn parse_annotation(i: &str, kind: AnnotationKind) -> PResult<'_, Parsed<'_>> {
        let (i, _) = tuple((tag(kind.keyword()), char(':'), space0, char('<')))(i)?;
        let date_from = i;
        let (i, date) = parse_date(i)?;
        let (i, _) = space1(i)?;
        let (i, day_of_week) = take_while1(|c: char| c.is_alphabetic())(i)?;
        let date_to = i;
        let (i, time) = opt(preceded(space1, parse_time))(i)?;
        let (i, repeat) = opt(preceded(space1, parse_repeat))(i)?;
        let (i, _) = space0(i)?;
        let (i, _) = char('>')(i)?;

        Ok((
            i,
            Parsed {
                date,
                day_of_week,
                time,
                repeat,
                date_from,
                date_to,
            },
        ))
    }

    fn parse_repeat(i: &str) -> PResult<'_, RepeatPeriod> {
        let (i, (_, count, unit)) = tuple((
            tag(".+"),
            map_res(digit1, |s: &str| s.parse::<u32>()),
            map_opt(anychar, RepeatUnit::from_char),
        ))(i)?;
        Ok((i, RepeatPeriod { count, unit }))
    }

    fn parse_date(i: &str) -> PResult<'_, NaiveDate> {
        map_res(
            tuple((
                map_res(take_while_m_n(4, 4, char_is_digit), |s: &str| {
                    s.parse::<i32>()
                }),
                char('-'),
                map_res(take_while_m_n(2, 2, char_is_digit), |s: &str| {
                    s.parse::<u32>()
                }),
                char('-'),
                map_res(take_while_m_n(2, 2, char_is_digit), |s: &str| {
                    s.parse::<u32>()
                }),
            )),
            |(y, _, m, _, d)| NaiveDate::from_ymd_opt(y, m, d).ok_or("invalid date"),
        )(i)
    }

    fn parse_time(i: &str) -> PResult<'_, NaiveTime> {
        map_res(
            tuple((
                map_res(take_while_m_n(1, 2, char_is_digit), |s: &str| {
                    s.parse::<u32>()
                }),
                char(':'),
                map_res(take_while_m_n(2, 2, char_is_digit), |s: &str| {
                    s.parse::<u32>()
                }),
            )),
            |(h, _, m)| NaiveTime::from_hms_opt(h, m, 0).ok_or("invalid time"),
        )(i)
    }

    fn take_while_m_n<F>(m: usize, n: usize, cond: F) -> impl Fn(&str) -> PResult<'_, &str>
    where
        F: Fn(char) -> bool + Copy,
    {
        move |i: &str| {
            let (i, out) = take_while(cond)(i)?;
            if out.len() < m || out.len() > n {
                Err(nom::Err::Error(VerboseError {
                    errors: vec![(i, VerboseErrorKind::Context("m_n"))],
                }))
            } else {
                Ok((i, out))
            }
        }
    }

    fn char_is_digit(c: char) -> bool {
        c.is_ascii_digit()
    }

}

pub mod recurrence {
    //! Marker state machine and repeat-period rescheduling.

    use crate::core::*;
    use chrono::{Days, Months, NaiveDate};
    use serde::{Deserialize, Serialize};
    use tracing::{debug, warn};

    /// Advance `current` one step through `style`'s cycle.
    ///
    /// A marker outside the style's vocabulary (or no marker) counts as the empty start.
    pub fn next_marker(
        current: Option<Marker>,
        style: Style,
        skip_active_state: bool,
    ) -> Option<Marker> {
        let sequence = style.sequence();
        let len = sequence.len();
        let index = sequence.iter().position(|m| *m == current).unwrap_or(0);
        let mut next = (index + 1) % len;
        if skip_active_state && next == Style::ACTIVE_INDEX {
            next = (next + 1) % len;
        }
        sequence[next]
    }

    impl RepeatPeriod {
        /// Calendar addition; months and years clamp to the end of the target month.
        pub fn advance(&self, date: NaiveDate) -> Result<NaiveDate, DomainError> {
            let shifted = match self.unit {
                RepeatUnit::Years => self
                    .count
                    .checked_mul(12)
                    .and_then(|months| date.checked_add_months(Months::new(months))),
                RepeatUnit::Months => date.checked_add_months(Months::new(self.count)),
                RepeatUnit::Weeks => date.checked_add_days(Days::new(u64::from(self.count) * 7)),
                RepeatUnit::Days => date.checked_add_days(Days::new(u64::from(self.count))),
            };
            shifted.ok_or(DomainError::DateOutOfRange {
                date,
                period: *self,
            })
        }
    }

    /// One annotation moved to its next occurrence.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Reschedule {
        pub kind: AnnotationKind,
        pub from: NaiveDate,
        pub to: NaiveDate,
        pub range: SourceRange,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Transition {
        pub final_marker: Option<Marker>,
        pub reschedules: Vec<Reschedule>,
    }

    /// Decide whether the block completes or recurs.
    ///
    /// Completing (`next == DONE`) a block with a repeat period on any annotation resets it
    /// to the style's start marker and moves every recurring annotation forward instead.
    pub fn decide_transition(
        current: Option<Marker>,
        next: Option<Marker>,
        style: Style,
        annotations: &Annotations,
    ) -> Transition {
        if next != Some(Marker::Done) || !annotations.is_recurring() {
            return Transition {
                final_marker: next,
                reschedules: Vec::new(),
            };
        }

        let reschedules = annotations
            .iter()
            .filter_map(|annotation| {
                let period = annotation.repeat?;
                match period.advance(annotation.date) {
                    Ok(to) => Some(Reschedule {
                        kind: annotation.kind,
                        from: annotation.date,
                        to,
                        range: annotation.date_range,
                    }),
                    Err(err) => {
                        warn!(kind = annotation.kind.keyword(), %err, "annotation left unchanged");
                        None
                    }
                }
            })
            .collect();

        let final_marker = Some(style.start_marker());
        debug!(?current, ?final_marker, "recurring task completed");
        Transition {
            final_marker,
            reschedules,
        }
    }

    /// Splice each rescheduled `YYYY-MM-DD Dow` into `text`.
    pub fn apply_reschedules(text: &str, reschedules: &[Reschedule]) -> String {
        let mut ordered: Vec<&Reschedule> = reschedules.iter().collect();
        ordered.sort_by_key(|r| std::cmp::Reverse(r.range.start));

        let mut out = text.to_string();
        for r in ordered {
            let stamp = format!("{} {}", r.to.format("%Y-%m-%d"), r.to.format("%a"));
            out.replace_range(r.range.start..r.range.end, &stamp);
        }
        out
    }

}

pub mod cycle {
    //! Top-level cycling over a batch of blocks.

    use crate::annotation::parse_annotations;
    use crate::config::Preferences;
    use crate::core::Marker;
    use crate::marker::{extract_marker, rewrite_marker};
    use crate::recurrence::{Reschedule, apply_reschedules, decide_transition, next_marker};
    use serde::{Deserialize, Serialize};
    use tracing::{debug, info};

    /// What one cycle did to a block.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct CycleOutcome {
        pub from: Option<Marker>,
        pub to: Option<Marker>,
        pub reschedules: Vec<Reschedule>,
        pub text: String,
    }

    pub fn cycle_block_detailed(text: &str, prefs: &Preferences) -> CycleOutcome {
        let current = extract_marker(text);
        let next = next_marker(current, prefs.preferred_style, prefs.skip_active_state);
        let annotations = parse_annotations(text);
        let transition = decide_transition(current, next, prefs.preferred_style, &annotations);

        let rescheduled = apply_reschedules(text, &transition.reschedules);
        let rewritten = rewrite_marker(&rescheduled, transition.final_marker);

        for r in &transition.reschedules {
            info!(kind = r.kind.keyword(), from = %r.from, to = %r.to, "rescheduled");
        }
        debug!(from = ?current, to = ?transition.final_marker, "cycled block");

        CycleOutcome {
            from: current,
            to: transition.final_marker,
            reschedules: transition.reschedules,
            text: rewritten,
        }
    }

    pub fn cycle_block(text: &str, prefs: &Preferences) -> String {
        cycle_block_detailed(text, prefs).text
    }

    /// Cycle every block independently; output order matches input order.
    pub fn cycle_blocks<S: AsRef<str>>(texts: &[S], prefs: &Preferences) -> Vec<String> {
        if texts.is_empty() {
            debug!("no blocks chosen, nothing to do");
            return Vec::new();
        }
        texts
            .iter()
            .map(|text| cycle_block(text.as_ref(), prefs))
            .collect()
    }

}

pub mod config {
    //! User preferences. Hosts pass them explicitly; nothing here is global.

    use crate::core::Style;
    use anyhow::{Context, Result};
    use serde::{Deserialize, Serialize};
    use std::{fs, path::Path};

    /// `{"preferredTodo": "LATER", "skipActiveState": false}`; missing keys take defaults.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase", default)]
    pub struct Preferences {
        #[serde(rename = "preferredTodo")]
        pub preferred_style: Style,
        pub skip_active_state: bool,
    }

    impl Preferences {
        pub fn new(preferred_style: Style, skip_active_state: bool) -> Self {
            Self {
                preferred_style,
                skip_active_state,
            }
        }

        pub fn from_json_str(input: &str) -> Result<Self> {
            serde_json::from_str(input).context("parsing preferences JSON")
        }

        pub fn load(path: &Path) -> Result<Self> {
            let text =
                fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
            Self::from_json_str(&text).with_context(|| format!("loading preferences {:?}", path))
        }

        /// Command-line flags win over the file; `None` keeps the file's value.
        pub fn with_overrides(
            mut self,
            style: Option<Style>,
            skip_active_state: Option<bool>,
        ) -> Self {
            if let Some(style) = style {
                self.preferred_style = style;
            }
            if let Some(skip) = skip_active_state {
                self.skip_active_state = skip;
            }
            self
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn defaults_match_editor_defaults() {
            let prefs = Preferences::from_json_str("{}").unwrap();
            assert_eq!(prefs, Preferences::new(Style::Later, false));
        }

        #[test]
        fn reads_camel_case_keys_and_ignores_others() {
            let prefs = Preferences::from_json_str(
                r#"{"preferredTodo": "todo", "skipActiveState": true, "theme": "dark"}"#,
            )
            .unwrap();
            assert_eq!(prefs, Preferences::new(Style::Todo, true));
        }

        #[test]
        fn rejects_unknown_style() {
            let err = Preferences::from_json_str(r#"{"preferredTodo": "NEXT"}"#).unwrap_err();
            assert!(format!("{err:#}").contains("unknown TODO style"));
        }

        #[test]
        fn overrides_apply_on_top() {
            let prefs = Preferences::default().with_overrides(Some(Style::Todo), Some(true));
            assert_eq!(prefs, Preferences::new(Style::Todo, true));
            let kept = Preferences::new(Style::Todo, true).with_overrides(None, None);
            assert_eq!(kept, Preferences::new(Style::Todo, true));
            let off = Preferences::new(Style::Todo, true).with_overrides(None, Some(false));
            assert_eq!(off, Preferences::new(Style::Todo, false));
        }

        #[test]
        fn loads_from_file() {
            let dir = tempfile::tempdir().expect("tempdir");
            let path = dir.path().join("prefs.json");
            fs::write(&path, r#"{"skipActiveState": true}"#).expect("write prefs");
            let prefs = Preferences::load(&path).expect("load");
            assert_eq!(prefs, Preferences::new(Style::Later, true));
            assert!(Preferences::load(&dir.path().join("missing.json")).is_err());
        }
    }
}

pub mod host {
    //! Host collaborator seam: choosing blocks, fetching live content, saving results.
    //!
    //! `run_cycle_command` is what a "Cycle TODO" command invocation does end to end.

    use crate::config::Preferences;
    use crate::cycle::cycle_blocks;
    use anyhow::{Context, Result, anyhow};
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use std::{
        fmt, fs,
        path::{Path, PathBuf},
    };
    use tracing::{debug, warn};
    use uuid::Uuid;

    /* ------------------------------- IDs ------------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct BlockId(pub Uuid);

    impl BlockId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    impl Default for BlockId {
        fn default() -> Self {
            Self::new()
        }
    }

    impl fmt::Display for BlockId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    /* ------------------------------ Blocks ------------------------------ */

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Block {
        pub id: BlockId,
        pub content: String,
    }

    /// Blocks a command applies to: the selection, else the block being edited.
    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    pub struct ChosenBlocks {
        pub blocks: Vec<Block>,
        pub from_selection: bool,
    }

    impl ChosenBlocks {
        pub fn is_empty(&self) -> bool {
            self.blocks.is_empty()
        }
    }

    /// Palette entry a host registers for the cycle command.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    pub struct CommandDescriptor {
        pub label: &'static str,
        pub key: &'static str,
        pub mac_keybinding: &'static str,
        pub keybinding: &'static str,
        pub mode: &'static str,
    }

    pub const COMMAND: CommandDescriptor = CommandDescriptor {
        label: "Cycle TODO (Do What I Mean)",
        key: "cycle-todo-dwim",
        mac_keybinding: "mod+shift+enter",
        keybinding: "ctrl+shift+enter",
        mode: "global",
    };

    pub trait BlockHost {
        /// Current multi-selection, `None` when nothing is selected.
        fn selected_blocks(&self) -> Result<Option<Vec<Block>>>;

        /// Block being edited, with its live (possibly unsaved) content.
        fn editing_block(&self) -> Result<Option<Block>>;

        fn update_block(&mut self, id: BlockId, content: &str) -> Result<()>;

        fn chosen_blocks(&self) -> Result<ChosenBlocks> {
            if let Some(blocks) = self.selected_blocks()? {
                return Ok(ChosenBlocks {
                    blocks,
                    from_selection: true,
                });
            }
            Ok(match self.editing_block()? {
                Some(block) => ChosenBlocks {
                    blocks: vec![block],
                    from_selection: false,
                },
                None => ChosenBlocks::default(),
            })
        }
    }

    /// Result of one command invocation. Failed saves are notices, not errors.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
    pub struct CommandReport {
        pub from_selection: bool,
        pub updated: Vec<BlockId>,
        pub failed: Vec<(BlockId, String)>,
    }

    impl CommandReport {
        pub fn is_noop(&self) -> bool {
            self.updated.is_empty() && self.failed.is_empty()
        }
    }

    pub fn run_cycle_command<H>(host: &mut H, prefs: &Preferences) -> Result<CommandReport>
    where
        H: BlockHost + ?Sized,
    {
        let chosen = host.chosen_blocks().context("resolving chosen blocks")?;
        let mut report = CommandReport {
            from_selection: chosen.from_selection,
            ..CommandReport::default()
        };
        if chosen.is_empty() {
            debug!("no selection and no block being edited");
            return Ok(report);
        }

        let texts: Vec<&str> = chosen.blocks.iter().map(|b| b.content.as_str()).collect();
        let rewritten = cycle_blocks(&texts, prefs);
        for (block, content) in chosen.blocks.iter().zip(rewritten) {
            match host.update_block(block.id, &content) {
                Ok(()) => report.updated.push(block.id),
                Err(err) => {
                    let msg = format!("{err:#}");
                    warn!(block = %block.id, error = %msg, "could not save block");
                    report.failed.push((block.id, msg));
                }
            }
        }
        Ok(report)
    }

    /* ---------------------------- Memory host ---------------------------- */

    /// In-memory host for embedders and tests.
    #[derive(Debug, Clone, Default)]
    pub struct MemoryHost {
        blocks: IndexMap<BlockId, String>,
        selection: Option<Vec<BlockId>>,
        editing: Option<BlockId>,
        live_content: Option<String>,
    }

    impl MemoryHost {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert(&mut self, content: impl Into<String>) -> BlockId {
            let id = BlockId::new();
            self.blocks.insert(id, content.into());
            id
        }

        pub fn select(&mut self, ids: impl IntoIterator<Item = BlockId>) {
            self.selection = Some(ids.into_iter().collect());
        }

        pub fn clear_selection(&mut self) {
            self.selection = None;
        }

        /// Start editing `id`; `live_content` is text typed but not yet saved.
        pub fn start_editing(&mut self, id: BlockId, live_content: Option<String>) {
            self.editing = Some(id);
            self.live_content = live_content;
        }

        pub fn stop_editing(&mut self) {
            self.editing = None;
            self.live_content = None;
        }

        pub fn content(&self, id: BlockId) -> Option<&str> {
            self.blocks.get(&id).map(String::as_str)
        }

        fn block(&self, id: BlockId) -> Result<Block> {
            let content = self
                .blocks
                .get(&id)
                .ok_or_else(|| anyhow!("unknown block {id}"))?;
            Ok(Block {
                id,
                content: content.clone(),
            })
        }
    }

    impl BlockHost for MemoryHost {
        fn selected_blocks(&self) -> Result<Option<Vec<Block>>> {
            self.selection
                .as_ref()
                .map(|ids| ids.iter().map(|id| self.block(*id)).collect::<Result<Vec<_>>>())
                .transpose()
        }

        fn editing_block(&self) -> Result<Option<Block>> {
            let Some(id) = self.editing else {
                return Ok(None);
            };
            let mut block = self.block(id)?;
            if let Some(live) = &self.live_content {
                block.content = live.clone();
            }
            Ok(Some(block))
        }

        fn update_block(&mut self, id: BlockId, content: &str) -> Result<()> {
            let slot = self
                .blocks
                .get_mut(&id)
                .ok_or_else(|| anyhow!("unknown block {id}"))?;
            *slot = content.to_string();
            if self.editing == Some(id) {
                self.live_content = None;
            }
            Ok(())
        }
    }

    /* ----------------------------- File host ----------------------------- */

    #[derive(Debug, Clone)]
    pub struct FileBlock {
        pub path: PathBuf,
        pub content: String,
    }

    /// Each file is one block and all files together are the selection.
    #[derive(Debug, Clone)]
    pub struct FileHost {
        blocks: IndexMap<BlockId, FileBlock>,
        write_back: bool,
    }

    impl FileHost {
        /// Read every file up front. With `write_back`, updates are saved to disk.
        pub fn open(paths: &[PathBuf], write_back: bool) -> Result<Self> {
            let mut blocks = IndexMap::new();
            for path in paths {
                let content =
                    fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
                blocks.insert(
                    BlockId::new(),
                    FileBlock {
                        path: path.clone(),
                        content,
                    },
                );
            }
            Ok(Self { blocks, write_back })
        }

        pub fn blocks(&self) -> impl Iterator<Item = &FileBlock> {
            self.blocks.values()
        }

        pub fn path_of(&self, id: BlockId) -> Option<&Path> {
            self.blocks.get(&id).map(|b| b.path.as_path())
        }
    }

    impl BlockHost for FileHost {
        fn selected_blocks(&self) -> Result<Option<Vec<Block>>> {
            if self.blocks.is_empty() {
                return Ok(None);
            }
            Ok(Some(
                self.blocks
                    .iter()
                    .map(|(id, b)| Block {
                        id: *id,
                        content: b.content.clone(),
                    })
                    .collect(),
            ))
        }

        fn editing_block(&self) -> Result<Option<Block>> {
            Ok(None)
        }

        fn update_block(&mut self, id: BlockId, content: &str) -> Result<()> {
            let block = self
                .blocks
                .get_mut(&id)
                .ok_or_else(|| anyhow!("unknown block {id}"))?;
            if self.write_back {
                fs::write(&block.path, content.as_bytes())
                    .with_context(|| format!("writing {:?}", block.path))?;
            }
            block.content = content.to_string();
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::core::Style;

        /// Host whose saves always fail.
        struct ReadOnlyHost(MemoryHost);

        impl BlockHost for ReadOnlyHost {
            fn selected_blocks(&self) -> Result<Option<Vec<Block>>> {
                self.0.selected_blocks()
            }
            fn editing_block(&self) -> Result<Option<Block>> {
                self.0.editing_block()
            }
            fn update_block(&mut self, id: BlockId, _content: &str) -> Result<()> {
                Err(anyhow!("block {id} is read-only"))
            }
        }

        #[test]
        fn nothing_chosen_is_a_noop() {
            let mut host = MemoryHost::new();
            let id = host.insert("foobar");
            let report = run_cycle_command(&mut host, &Preferences::default()).unwrap();
            assert!(report.is_noop());
            assert_eq!(host.content(id), Some("foobar"));
        }

        #[test]
        fn selection_wins_over_editing() {
            let mut host = MemoryHost::new();
            let a = host.insert("foo");
            let b = host.insert("bar");
            let c = host.insert("baz");
            host.select([a, b]);
            host.start_editing(c, None);

            let report = run_cycle_command(&mut host, &Preferences::default()).unwrap();
            assert!(report.from_selection);
            assert_eq!(report.updated, vec![a, b]);
            assert_eq!(host.content(a), Some("LATER foo"));
            assert_eq!(host.content(b), Some("LATER bar"));
            assert_eq!(host.content(c), Some("baz"));
        }

        #[test]
        fn editing_block_uses_live_content() {
            let mut host = MemoryHost::new();
            let id = host.insert("");
            host.start_editing(id, Some("foobar".into()));
            let prefs = Preferences::new(Style::Later, false);

            let mut seen = vec![];
            for _ in 0..4 {
                let report = run_cycle_command(&mut host, &prefs).unwrap();
                assert!(!report.from_selection);
                seen.push(host.content(id).unwrap().to_string());
            }
            assert_eq!(seen, vec!["LATER foobar", "NOW foobar", "DONE foobar", "foobar"]);
        }

        #[test]
        fn clearing_selection_falls_back_to_editing_block() {
            let mut host = MemoryHost::new();
            let a = host.insert("foo");
            let b = host.insert("bar");
            host.select([a]);
            host.start_editing(b, Some("bar typed".into()));
            host.clear_selection();

            let report = run_cycle_command(&mut host, &Preferences::default()).unwrap();
            assert!(!report.from_selection);
            assert_eq!(report.updated, vec![b]);
            assert_eq!(host.content(a), Some("foo"));
            assert_eq!(host.content(b), Some("LATER bar typed"));

            host.stop_editing();
            let report = run_cycle_command(&mut host, &Preferences::default()).unwrap();
            assert!(report.is_noop());
            assert_eq!(host.content(b), Some("LATER bar typed"));
        }

        #[test]
        fn failed_saves_are_reported_not_fatal() {
            let mut inner = MemoryHost::new();
            let a = inner.insert("foo");
            let b = inner.insert("bar");
            inner.select([a, b]);
            let mut host = ReadOnlyHost(inner);

            let report = run_cycle_command(&mut host, &Preferences::default()).unwrap();
            assert!(report.updated.is_empty());
            assert_eq!(report.failed.len(), 2);
            assert!(report.failed[0].1.contains("read-only"));
        }

        #[test]
        fn unknown_selection_is_an_error() {
            let mut host = MemoryHost::new();
            host.select([BlockId::new()]);
            assert!(run_cycle_command(&mut host, &Preferences::default()).is_err());
        }

        #[test]
        fn command_descriptor_matches_palette_entry() {
            assert_eq!(COMMAND.key, "cycle-todo-dwim");
            assert_eq!(COMMAND.mac_keybinding, "mod+shift+enter");
        }
    }
}

pub use config::Preferences;
pub use crate::core::{Marker, Style};
pub use cycle::{cycle_block, cycle_blocks};
