//! Chip/line topology as reported by the libgpiod command line tools.
//!
//! Two output dialects are understood: `lsgpio` (tried first) and `gpioinfo`.
//! Parsing is tolerant: malformed numbers become zero and a bad line never
//! discards the rest of the output.

use std::env;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;

use log::debug;
use regex::Regex;
use serde::Serialize;

use crate::error::AppError;

static LSGPIO_CHIP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"GPIO chip: (\S+), "(.+)", (\d+) GPIO lines"#).unwrap());
static LSGPIO_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s*line\s*(\d+):\s*"([^"]*)"\s*(.*?)\s*\[([^\[\]]*)\]\s*$"#).unwrap()
});
static GPIOINFO_CHIP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(gpiochip\d+) - (\d+) lines:").unwrap());
static GPIOINFO_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"^\s*line\s*(\d+):\s*["']?([^"'\s]+)["']?\s*(\S+)\s*(input|output)\s*(active-high|active-low)(?:\s*\[([^\[\]]*)\])?"#,
    )
    .unwrap()
});

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LineDirection {
    Input,
    Output,
    Unknown,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LineInfo {
    pub number: u32,
    pub name: String,
    pub function: String,
    pub used: bool,
    pub direction: LineDirection,
    pub flags: Vec<String>,
}

impl LineInfo {
    /// Stand-in for unrecognised text inside an `lsgpio` chip block.
    fn placeholder() -> Self {
        Self {
            number: 0,
            name: String::new(),
            function: "unused".to_string(),
            used: false,
            direction: LineDirection::Unknown,
            flags: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChipInfo {
    pub device_name: String,
    pub name: String,
    pub lines: Vec<LineInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyTool {
    Lsgpio,
    Gpioinfo,
}

impl TopologyTool {
    pub const PREFERENCE: [TopologyTool; 2] = [TopologyTool::Lsgpio, TopologyTool::Gpioinfo];

    pub fn command(self) -> &'static str {
        match self {
            TopologyTool::Lsgpio => "lsgpio",
            TopologyTool::Gpioinfo => "gpioinfo",
        }
    }

    pub fn parse(self, output: &str) -> Vec<ChipInfo> {
        match self {
            TopologyTool::Lsgpio => parse_lsgpio(output),
            TopologyTool::Gpioinfo => parse_gpioinfo(output),
        }
    }

    /// First tool of [`Self::PREFERENCE`] found in `search_path`.
    pub fn locate(search_path: &OsStr) -> Option<(Self, PathBuf)> {
        Self::PREFERENCE
            .into_iter()
            .find_map(|tool| find_executable(tool.command(), search_path).map(|p| (tool, p)))
    }
}

pub(crate) fn find_executable(name: &str, search_path: &OsStr) -> Option<PathBuf> {
    env::split_paths(search_path)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Runs the preferred available tool from `PATH` and parses its output.
pub fn discover() -> Result<Vec<ChipInfo>, AppError> {
    let search_path = env::var_os("PATH").unwrap_or_default();
    discover_in(&search_path)
}

pub fn discover_in(search_path: &OsStr) -> Result<Vec<ChipInfo>, AppError> {
    let (tool, path) = TopologyTool::locate(search_path).ok_or_else(|| {
        AppError::ToolNotFound("lsgpio and gpioinfo command not found".into())
    })?;
    debug!("topology: using {}", path.display());

    let text = run_tool(tool.command(), &path, &[])?;
    Ok(tool.parse(&text))
}

/// Runs `path` with `args` and returns its stdout, which must be UTF-8.
pub(crate) fn run_tool(name: &str, path: &Path, args: &[&str]) -> Result<String, AppError> {
    let output = Command::new(path)
        .args(args)
        .output()
        .map_err(|e| AppError::Execution {
            tool: name.to_string(),
            reason: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(AppError::Execution {
            tool: name.to_string(),
            reason: format!(
                "{}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }

    String::from_utf8(output.stdout).map_err(|e| AppError::Parse(format!("{name} output: {e}")))
}

fn split_flags(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn parse_lsgpio(output: &str) -> Vec<ChipInfo> {
    let mut chips = Vec::new();
    let mut current: Option<ChipInfo> = None;

    // Blank separators (lsgpio prints one after each chip) are skipped, so
    // they never turn into placeholder lines.
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        if let Some(caps) = LSGPIO_CHIP.captures(line) {
            chips.extend(current.take());
            current = Some(ChipInfo {
                device_name: caps[1].to_string(),
                name: caps[2].to_string(),
                lines: Vec::new(),
            });
            continue;
        }

        let Some(chip) = current.as_mut() else {
            continue;
        };

        match LSGPIO_LINE.captures(line) {
            Some(caps) => {
                let function = caps[3].trim_matches('"').to_string();
                let mut flags = split_flags(&caps[4]);
                let used = function == "used" || flags.iter().any(|f| f == "used");
                let direction = if flags.iter().any(|f| f == "output") {
                    LineDirection::Output
                } else {
                    LineDirection::Input
                };
                if !flags.is_empty() {
                    flags.remove(0);
                }

                chip.lines.push(LineInfo {
                    number: caps[1].parse().unwrap_or(0),
                    name: caps[2].to_string(),
                    function,
                    used,
                    direction,
                    flags,
                });
            }
            None => chip.lines.push(LineInfo::placeholder()),
        }
    }

    chips.extend(current);
    chips
}

pub fn parse_gpioinfo(output: &str) -> Vec<ChipInfo> {
    let mut chips = Vec::new();
    let mut current: Option<ChipInfo> = None;

    for line in output.lines() {
        if let Some(caps) = GPIOINFO_CHIP.captures(line) {
            chips.extend(current.take());
            current = Some(ChipInfo {
                device_name: caps[1].to_string(),
                name: caps[1].to_string(),
                lines: Vec::new(),
            });
        } else if let Some(caps) = GPIOINFO_LINE.captures(line)
            && let Some(chip) = current.as_mut()
        {
            let used = caps
                .get(6)
                .map(|m| {
                    m.as_str()
                        .split(|c: char| c == ',' || c.is_whitespace())
                        .any(|w| w == "used")
                })
                .unwrap_or(false);
            let direction = if &caps[4] == "output" {
                LineDirection::Output
            } else {
                LineDirection::Input
            };

            chip.lines.push(LineInfo {
                number: caps[1].parse().unwrap_or(0),
                name: caps[2].to_string(),
                function: caps[3].trim_matches('"').to_string(),
                used,
                direction,
                flags: vec![caps[5].to_string()],
            });
        }
    }

    chips.extend(current);
    chips
}

#[cfg(test)]
mod tests {
    use super::*;

    const LSGPIO_SAMPLE: &str = "GPIO chip: gpiochip0, \"pinctrl-bcm2835\", 54 GPIO lines\n\
        \tline  0:     \"ID_SDA\"       unused [input]\n\
        \tline  4:     \"GPIO4\"        \"onewire\" [used, output, active-low]\n\
        \tgarbage that matches nothing\n\
        GPIO chip: gpiochip1, \"brcmvirt-gpio\", 2 GPIO lines\n\
        \tline  0:     \"LED\"          unused [output, open-drain]\n";

    #[test]
    fn lsgpio_single_used_output_line() {
        let chips = parse_lsgpio(
            "GPIO chip: gpiochip0, \"pinctrl-bcm2835\", 54 GPIO lines\n line   5:      \"GPIO5\"  output  [used, output]",
        );

        assert_eq!(chips.len(), 1);
        assert_eq!(chips[0].name, "pinctrl-bcm2835");
        assert_eq!(chips[0].device_name, "gpiochip0");
        let line = &chips[0].lines[0];
        assert_eq!(chips[0].lines.len(), 1);
        assert_eq!(line.number, 5);
        assert_eq!(line.name, "GPIO5");
        assert!(line.used);
        assert_eq!(line.direction, LineDirection::Output);
        assert_eq!(line.flags, vec!["output".to_string()]);
    }

    #[test]
    fn lsgpio_header_only_has_no_lines() {
        let chips = parse_lsgpio("GPIO chip: gpiochip0, \"pinctrl-bcm2835\", 54 GPIO lines\n");
        assert_eq!(chips.len(), 1);
        assert!(chips[0].lines.is_empty());
    }

    #[test]
    fn empty_output_has_no_chips() {
        assert!(parse_lsgpio("").is_empty());
        assert!(parse_gpioinfo("").is_empty());
    }

    #[test]
    fn lsgpio_multiple_chips_and_placeholder() {
        let chips = parse_lsgpio(LSGPIO_SAMPLE);
        assert_eq!(chips.len(), 2);

        let first = &chips[0];
        assert_eq!(first.lines.len(), 3);
        assert!(!first.lines[0].used);
        assert_eq!(first.lines[0].function, "unused");
        assert_eq!(first.lines[0].direction, LineDirection::Input);

        assert_eq!(first.lines[1].function, "onewire");
        assert!(first.lines[1].used);
        assert_eq!(first.lines[1].direction, LineDirection::Output);
        assert_eq!(first.lines[1].flags, vec!["output", "active-low"]);

        assert_eq!(first.lines[2], LineInfo::placeholder());

        assert_eq!(chips[1].name, "brcmvirt-gpio");
        assert_eq!(chips[1].lines[0].flags, vec!["open-drain"]);
    }

    #[test]
    fn lsgpio_blank_lines_are_not_placeholders() {
        let chips = parse_lsgpio(
            "GPIO chip: gpiochip0, \"pinctrl-bcm2835\", 54 GPIO lines\n\
             \tline  2:     \"SDA1\"         unused [input]\n\
             \n\
             \t   \n\
             \tline  3:     \"SCL1\"         unused [input]\n\
             \n\
             GPIO chip: gpiochip1, \"brcmvirt-gpio\", 2 GPIO lines\n\
             \n",
        );

        assert_eq!(chips.len(), 2);
        let numbers: Vec<u32> = chips[0].lines.iter().map(|l| l.number).collect();
        assert_eq!(numbers, vec![2, 3]);
        assert!(!chips[0].lines.contains(&LineInfo::placeholder()));
        assert!(chips[1].lines.is_empty());
    }

    #[test]
    fn lsgpio_overflowing_offset_defaults_to_zero() {
        let chips = parse_lsgpio(
            "GPIO chip: gpiochip0, \"x\", 1 GPIO lines\n line 99999999999: \"BIG\" unused [input]",
        );
        assert_eq!(chips[0].lines[0].number, 0);
        assert_eq!(chips[0].lines[0].name, "BIG");
    }

    #[test]
    fn gpioinfo_single_used_output_line() {
        let chips = parse_gpioinfo(
            "gpiochip0 - 54 lines:\n\tline   5:      \"GPIO5\"       \"myapp\"   output   active-high [used]",
        );

        assert_eq!(chips.len(), 1);
        assert_eq!(chips[0].name, "gpiochip0");
        let line = &chips[0].lines[0];
        assert_eq!(line.number, 5);
        assert_eq!(line.name, "GPIO5");
        assert_eq!(line.function, "myapp");
        assert!(line.used);
        assert_eq!(line.direction, LineDirection::Output);
        assert_eq!(line.flags, vec!["active-high".to_string()]);
    }

    #[test]
    fn gpioinfo_ignores_unmatched_text() {
        let chips = parse_gpioinfo(
            "gpiochip0 - 2 lines:\n\
             \tline   0:      \"ID_SDA\"       unused   input  active-high\n\
             \tsomething unexpected\n\
             gpiochip1 - 8 lines:\n",
        );

        assert_eq!(chips.len(), 2);
        assert_eq!(chips[0].lines.len(), 1);
        assert!(!chips[0].lines[0].used);
        assert_eq!(chips[0].lines[0].direction, LineDirection::Input);
        assert!(chips[1].lines.is_empty());
    }

    #[test]
    fn serializes_camel_case_chip() {
        let chips = parse_gpioinfo("gpiochip0 - 1 lines:\n");
        let json = serde_json::to_value(&chips[0]).unwrap();
        assert_eq!(json["deviceName"], "gpiochip0");
        assert!(json["lines"].as_array().unwrap().is_empty());
    }

    #[test]
    fn missing_tools_is_tool_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = discover_in(dir.path().as_os_str()).unwrap_err();
        assert!(matches!(err, AppError::ToolNotFound(_)));
    }

    #[cfg(unix)]
    mod with_tools {
        use super::*;
        use serial_test::serial;
        use std::fs;
        use std::os::unix::fs::PermissionsExt;

        fn install_tool(dir: &Path, name: &str, script: &str) {
            let path = dir.join(name);
            fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        }

        #[test]
        #[serial]
        fn prefers_lsgpio_over_gpioinfo() {
            let dir = tempfile::tempdir().unwrap();
            install_tool(dir.path(), "gpioinfo", "echo 'gpiochip9 - 1 lines:'");
            install_tool(
                dir.path(),
                "lsgpio",
                "echo 'GPIO chip: gpiochip0, \"pinctrl-bcm2835\", 54 GPIO lines'",
            );

            let (tool, _) = TopologyTool::locate(dir.path().as_os_str()).unwrap();
            assert_eq!(tool, TopologyTool::Lsgpio);

            let chips = discover_in(dir.path().as_os_str()).unwrap();
            assert_eq!(chips.len(), 1);
            assert_eq!(chips[0].name, "pinctrl-bcm2835");
        }

        #[test]
        #[serial]
        fn falls_back_to_gpioinfo() {
            let dir = tempfile::tempdir().unwrap();
            install_tool(dir.path(), "gpioinfo", "echo 'gpiochip0 - 54 lines:'");

            let chips = discover_in(dir.path().as_os_str()).unwrap();
            assert_eq!(chips[0].device_name, "gpiochip0");
        }

        #[test]
        #[serial]
        fn failing_tool_is_execution_error() {
            let dir = tempfile::tempdir().unwrap();
            install_tool(dir.path(), "lsgpio", "echo 'permission denied' >&2; exit 1");

            let err = discover_in(dir.path().as_os_str()).unwrap_err();
            assert!(matches!(err, AppError::Execution { ref tool, .. } if tool == "lsgpio"));
        }

        #[test]
        #[serial]
        fn non_executable_file_is_skipped() {
            let dir = tempfile::tempdir().unwrap();
            fs::write(dir.path().join("lsgpio"), "not a program").unwrap();
            assert!(TopologyTool::locate(dir.path().as_os_str()).is_none());
        }
    }
}
