use std::path::{Path, PathBuf};
use chrono::NaiveDateTime;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

static TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{(\w+)\}").expect("token pattern compiles"));

#[derive(Debug, Clone, Copy)]
pub struct PathParams {
  pub time: NaiveDateTime,
  pub branch_id: i64,
  pub station_id: i64,
  /// Zero means "same as station".
  pub gate_id: i64,
}

fn pad_id(id: i64) -> String {
  format!("{:02}", id)
}

/// Expands `{YYYY}`-style placeholders. Unknown placeholders are kept as-is.
pub fn format_path(template: &str, params: &PathParams) -> String {
  let station = pad_id(params.station_id);
  let gate = if params.gate_id != 0 { pad_id(params.gate_id) } else { station.clone() };
  let branch = pad_id(params.branch_id);

  TOKEN_RE
    .replace_all(template, |caps: &Captures| {
      let t = params.time;
      match &caps[1] {
        "YYYY" => t.format("%Y").to_string(),
        "YY" => t.format("%y").to_string(),
        "MM" => t.format("%m").to_string(),
        "DD" => t.format("%d").to_string(),
        "Date" | "DATE" | "date" => t.format("%Y%m%d").to_string(),
        "Time" | "time" => t.format("%H%M%S").to_string(),
        "BranchID" | "branch_id" => branch.clone(),
        "StationID" | "station_id" => station.clone(),
        "GateID" | "gate_id" => gate.clone(),
        _ => caps[0].to_string(),
      }
    })
    .into_owned()
}

/// True when `template` expands differently for every calendar day, either
/// through a full date token or through year, month and day tokens together.
pub fn identifies_day(template: &str) -> bool {
  let tokens: Vec<&str> = TOKEN_RE.captures_iter(template).filter_map(|c| c.get(1)).map(|m| m.as_str()).collect();
  let has = |names: &[&str]| tokens.iter().any(|t| names.contains(t));
  has(&["Date", "DATE", "date"]) || (has(&["DD"]) && has(&["MM"]) && has(&["YYYY", "YY"]))
}

/// Location of one logical day's transaction file under `root_folder`.
pub fn datasource_path(root_folder: &str, template: &str, params: &PathParams) -> PathBuf {
  let relative = format_path(template, params);
  Path::new(root_folder).join(relative)
}
