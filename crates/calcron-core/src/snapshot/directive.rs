//! Action directives embedded in event descriptions
//!
//! Each non-empty description line is one action:
//!
//! ```text
//! echo 'Wake up!'               runs at the event start
//! +10: echo 'You are late'      10 minutes after the start
//! -60: start_heating.py         one hour before the start
//! end -10: dim_lights.sh        10 minutes before the end
//! end: lights_off.sh            at the end
//! # comment lines are ignored
//! ```

use regex::Regex;
use std::sync::LazyLock;

static DIRECTIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(?:(?P<anchor>start|end)\s*(?P<anchor_offset>[+-]\s*\d+)?|(?P<offset>[+-]?\d+))\s*:\s*(?P<command>\S.*)$",
    )
    .expect("directive pattern is valid")
});

/// Point of the event an offset is measured from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    Start,
    End,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub anchor: Anchor,
    pub offset_minutes: i64,
    pub command: String,
}

/// A directive line whose offset is not a representable number of minutes
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("offset out of range in directive '{line}'")]
pub struct InvalidDirective {
    pub line: String,
}

/// Parse every directive of an event description, in line order.
///
/// Invalid lines keep their position so that the index of every later
/// directive stays the same.
pub fn parse_directives(description: &str) -> Vec<Result<Directive, InvalidDirective>> {
    description
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(parse_line)
        .collect()
}

fn parse_line(line: &str) -> Result<Directive, InvalidDirective> {
    let Some(caps) = DIRECTIVE.captures(line) else {
        return Ok(Directive {
            anchor: Anchor::Start,
            offset_minutes: 0,
            command: line.to_string(),
        });
    };

    let anchor = match caps.name("anchor").map(|m| m.as_str().to_ascii_lowercase()) {
        Some(a) if a == "end" => Anchor::End,
        _ => Anchor::Start,
    };

    let offset_minutes = match caps.name("anchor_offset").or_else(|| caps.name("offset")) {
        Some(m) => parse_offset(m.as_str()).ok_or_else(|| InvalidDirective {
            line: line.to_string(),
        })?,
        None => 0,
    };

    Ok(Directive {
        anchor,
        offset_minutes,
        command: caps["command"].trim().to_string(),
    })
}

fn parse_offset(raw: &str) -> Option<i64> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    let digits = compact.trim_start_matches(['+', '-']);
    let magnitude: i64 = digits.parse().ok()?;
    if compact.starts_with('-') {
        magnitude.checked_neg()
    } else {
        Some(magnitude)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_valid(description: &str) -> Vec<Directive> {
        parse_directives(description)
            .into_iter()
            .collect::<Result<_, _>>()
            .unwrap()
    }

    #[test]
    fn test_bare_line_runs_at_start() {
        let directives = parse_valid("echo 'Wake up!'");
        assert_eq!(
            directives,
            vec![Directive {
                anchor: Anchor::Start,
                offset_minutes: 0,
                command: "echo 'Wake up!'".to_string(),
            }]
        );
    }

    #[test]
    fn test_start_offsets() {
        let directives =
            parse_valid("-60: start_heating.py\n0: turn_music_on.py\n+30: stop_heating.py");
        let offsets: Vec<_> = directives.iter().map(|d| d.offset_minutes).collect();
        assert_eq!(offsets, vec![-60, 0, 30]);
        assert!(directives.iter().all(|d| d.anchor == Anchor::Start));
        assert_eq!(directives[1].command, "turn_music_on.py");
    }

    #[test]
    fn test_end_anchor() {
        let directives = parse_valid("Turn on lights\nend -10: Dim lights\nEND: Turn off lights");
        assert_eq!(directives.len(), 3);
        assert_eq!(directives[1].anchor, Anchor::End);
        assert_eq!(directives[1].offset_minutes, -10);
        assert_eq!(directives[1].command, "Dim lights");
        assert_eq!(directives[2].anchor, Anchor::End);
        assert_eq!(directives[2].offset_minutes, 0);
    }

    #[test]
    fn test_colon_inside_command_is_kept() {
        let directives = parse_valid("curl http://localhost:8080/hook\nstart +5: echo a:b");
        assert_eq!(directives[0].command, "curl http://localhost:8080/hook");
        assert_eq!(directives[0].offset_minutes, 0);
        assert_eq!(directives[1].command, "echo a:b");
        assert_eq!(directives[1].offset_minutes, 5);
    }

    #[test]
    fn test_overflowing_offset_is_rejected_in_place() {
        let directives = parse_directives("99999999999999999999: boom\n+5: after.sh");

        assert_eq!(
            directives[0],
            Err(InvalidDirective {
                line: "99999999999999999999: boom".to_string()
            })
        );
        assert_eq!(directives[1].as_ref().map(|d| d.offset_minutes), Ok(5));
    }

    #[test]
    fn test_blank_and_comment_lines_skipped() {
        let directives = parse_valid("\n  # nightly jobs\n\n  backup.sh  \n");
        assert_eq!(directives.len(), 1);
        assert_eq!(directives[0].command, "backup.sh");
    }
}
