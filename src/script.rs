//! The embedded remote processor script and the fault-code set.
//!
//! The processor is an external collaborator with a fixed contract: it
//! receives the cutoff as `$1` (`YYYYMMDDHHMM`, `0` for all time), scans
//! log lines whose leading field is a timestamp at or after the cutoff,
//! and emits one `<count> <code> <last-timestamp>` line per distinct fault
//! code (count descending) followed by exactly one trailing
//! `<failure-count> SAOBO Errors <last-failure-timestamp-or-dash>` line.

/// The closed set of emergency fault codes the processor recognizes.
///
/// This is the single source of truth: the awk alternation below is
/// generated from it and local lookups use the same slice.
pub const EMCY_CODES: &[&str] = &[
    "0000", "1000", "2310", "2340", "3210", "3220", "4280", "4310", "5441", "5442", "5443",
    "6100", "7500", "8110", "8130", "8331", "8580", "8611", "9000", "FF01", "FF02", "FF03",
    "FF04", "FF05",
];

/// Category name of the trailing generic-failure summary line.
pub const FAILURE_CATEGORY: &str = "SAOBO Errors";

/// Whether a code belongs to the recognized emergency set.
pub fn is_known_code(code: &str) -> bool {
    EMCY_CODES.contains(&code)
}

const SCRIPT_TEMPLATE: &str = r#"#!/bin/sh
since="${1:-0}"
{ zcat /var/log/controller/*-console.txt-*.gz 2>/dev/null;
  cat /var/log/controller/*-console.txt 2>/dev/null;
} | awk -v since="$since" '
BEGIN{IGNORECASE=1}
{
  split($1, dt, /[T:-]/)
  if (length(dt[1])==0 || length(dt[2])==0 || length(dt[3])==0) next
  datenum = dt[1] dt[2] dt[3]
  timenum = dt[4] * 100 + dt[5]
  datetime = datenum * 10000 + timenum

  if (datetime >= since) {
    line = $0
    if (/EMCY/) {
      match(line, /(__CODES__)/)
      if (RSTART > 0) {
        code = substr(line, RSTART, RLENGTH)
        emcy_count[code]++
        emcy_last[code] = $1
      }
    }
    if (/failure/) {
      failure_count++
      failure_last = $1
    }
  }
}
END {
  for (code in emcy_count) {
    print emcy_count[code], code, emcy_last[code] | "sort -rn"
  }
  close("sort -rn")
  print (failure_count ? failure_count : 0) " SAOBO Errors " (failure_last ? failure_last : "-")
}'
"#;

/// Render the default processor script.
pub fn default_script() -> String {
    SCRIPT_TEMPLATE.replace("__CODES__", &EMCY_CODES.join("|"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_embeds_every_code() {
        let script = default_script();
        assert!(!script.contains("__CODES__"));
        for code in EMCY_CODES {
            assert!(script.contains(code), "missing {code}");
        }
        assert!(script.contains("SAOBO Errors"));
    }

    #[test]
    fn script_reads_cutoff_from_argv() {
        let script = default_script();
        assert!(script.contains(r#"since="${1:-0}""#));
        // The legacy baked-in substitution marker must be gone for good.
        assert!(!script.contains("%SINCE%"));
    }

    #[test]
    fn code_lookup_is_exact() {
        assert!(is_known_code("3220"));
        assert!(is_known_code("FF01"));
        assert!(!is_known_code("ff01"));
        assert!(!is_known_code("1234"));
    }
}
