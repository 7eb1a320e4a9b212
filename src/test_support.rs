//! Step-recording assertions shared by unit and integration tests.
//!
//! A `TestReport` records what a test set up, did, and asserted. When
//! `TEST_REPORT_DIR` is set, each report is written there as one JSON file
//! on drop, so a failing CI run shows the steps leading up to the failure.

use serde::Serialize;
use std::fmt::{Debug, Display};
use std::path::PathBuf;
use std::sync::Mutex;

/// Create a `TestReport` named after the enclosing test function.
#[macro_export]
macro_rules! test_report {
    ($title:expr) => {{
        fn f() {}
        fn type_name_of<T>(_: T) -> &'static str {
            std::any::type_name::<T>()
        }
        let name = type_name_of(f);
        let name = name.strip_suffix("::f").unwrap_or(name);
        let name = name.strip_suffix("::{{closure}}").unwrap_or(name);
        $crate::test_support::TestReport::new(name, $title, file!(), line!())
    }};
}

#[derive(Serialize)]
#[serde(tag = "kind", content = "text", rename_all = "snake_case")]
enum Step {
    Setup(String),
    Action(String),
    Output(String),
    Pass(String),
    Fail(String),
}

#[derive(Serialize)]
struct Report<'a> {
    test: &'a str,
    title: &'a str,
    source: String,
    steps: &'a [Step],
    result: &'a str,
}

pub struct TestReport {
    full_path: String,
    title: String,
    source_file: &'static str,
    source_line: u32,
    steps: Mutex<Vec<Step>>,
    report_dir: Option<PathBuf>,
}

const MAX_DISPLAY: usize = 400;

fn display<T: Debug + ?Sized>(value: &T) -> String {
    let s = format!("{:?}", value);
    if s.len() <= MAX_DISPLAY {
        return s;
    }
    let mut cut = MAX_DISPLAY;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}… ({} bytes)", &s[..cut], s.len())
}

impl TestReport {
    pub fn new(full_path: &str, title: &str, source_file: &'static str, source_line: u32) -> Self {
        Self {
            full_path: full_path.to_string(),
            title: title.to_string(),
            source_file,
            source_line,
            steps: Mutex::new(Vec::new()),
            report_dir: std::env::var_os("TEST_REPORT_DIR").map(PathBuf::from),
        }
    }

    fn push(&self, step: Step) {
        self.steps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(step);
    }

    pub fn setup(&self, msg: impl Display) {
        self.push(Step::Setup(msg.to_string()));
    }

    pub fn action(&self, msg: impl Display) {
        self.push(Step::Action(msg.to_string()));
    }

    pub fn output(&self, label: &str, text: impl Debug) {
        self.push(Step::Output(format!("{}: {}", label, display(&text))));
    }

    fn record(&self, pass: bool, msg: String) {
        self.push(if pass { Step::Pass(msg) } else { Step::Fail(msg) });
    }

    pub fn assert_eq<A, E>(&self, label: &str, actual: &A, expected: &E)
    where
        A: PartialEq<E> + Debug + ?Sized,
        E: Debug + ?Sized,
    {
        let pass = actual == expected;
        self.record(
            pass,
            format!("{}: {} == {}", label, display(actual), display(expected)),
        );
        assert!(
            pass,
            "{}: expected {:?}, got {:?}",
            label, expected, actual
        );
    }

    pub fn assert_true(&self, label: &str, value: bool) {
        self.record(value, label.to_string());
        assert!(value, "{}", label);
    }

    pub fn assert_contains(&self, label: &str, haystack: &str, needle: &str) {
        let pass = haystack.contains(needle);
        self.record(
            pass,
            format!("{}: {} contains {:?}", label, display(haystack), needle),
        );
        assert!(pass, "{}: {:?} does not contain {:?}", label, haystack, needle);
    }

    fn write(&self) {
        let Some(dir) = &self.report_dir else {
            return;
        };
        let steps = self.steps.lock().unwrap_or_else(|e| e.into_inner());
        let report = Report {
            test: &self.full_path,
            title: &self.title,
            source: format!("{}:{}", self.source_file, self.source_line),
            steps: &steps,
            result: if std::thread::panicking() { "fail" } else { "pass" },
        };
        let Ok(json) = serde_json::to_string_pretty(&report) else {
            return;
        };
        let _ = std::fs::create_dir_all(dir);
        let file = format!("{}.json", self.full_path.replace("::", "__"));
        let _ = std::fs::write(dir.join(file), json);
    }
}

impl Drop for TestReport {
    fn drop(&mut self) {
        self.write();
    }
}
