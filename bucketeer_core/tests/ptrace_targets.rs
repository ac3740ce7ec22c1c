use bucketeer_core::bucket::OutputRoot;
use bucketeer_core::config::{TargetCommand, TriageConfig};
use bucketeer_core::corpus::{CorpusEntry, scan_input_dir};
use bucketeer_core::driver::BatchDriver;
use bucketeer_core::executor::{Executor, PtraceExecutor, RunResult};
use bucketeer_core::fingerprint::{Fingerprint, FrameId};
use bucketeer_core::signals;
use serial_test::serial;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};
use tempfile::tempdir;

const FRAMES: usize = 4;

fn config(timeout_ms: u64, program: impl AsRef<Path>, args: &[&str]) -> TriageConfig {
    TriageConfig {
        input_dir: PathBuf::from("unused-in"),
        output_dir: PathBuf::from("unused-out"),
        timeout_ms,
        memory_limit_mb: None,
        frame_count: FRAMES,
        target: TargetCommand {
            program: program.as_ref().to_path_buf(),
            args: args.iter().map(|a| a.to_string()).collect(),
        },
    }
}

fn input(dir: &Path, name: &str, data: &[u8]) -> CorpusEntry {
    let path = dir.join(name);
    fs::write(&path, data).unwrap();
    CorpusEntry::new(path, name.into(), data.len() as u64)
}

#[test]
#[serial]
fn clean_exit_is_clean() {
    signals::install().unwrap();
    let dir = tempdir().unwrap();
    let entry = input(dir.path(), "hello", b"hello\n");

    let mut executor = PtraceExecutor::new(&config(2000, "/bin/cat", &["@@"]));
    assert_eq!(executor.execute(&entry).unwrap(), RunResult::Clean);
}

#[test]
#[serial]
fn nonzero_exit_is_still_clean() {
    signals::install().unwrap();
    let dir = tempdir().unwrap();
    let entry = input(dir.path(), "in", b"x");

    let mut executor = PtraceExecutor::new(&config(2000, "/bin/sh", &["-c", "exit 3", "@@"]));
    assert_eq!(executor.execute(&entry).unwrap(), RunResult::Clean);
}

#[test]
#[serial]
fn self_inflicted_segv_is_a_crash() {
    signals::install().unwrap();
    let dir = tempdir().unwrap();
    let entry = input(dir.path(), "boom", b"boom");

    let mut executor =
        PtraceExecutor::new(&config(2000, "/bin/sh", &["-c", "kill -SEGV $$", "@@"]));
    match executor.execute(&entry).unwrap() {
        RunResult::Crashed(fingerprint) => {
            assert_eq!(fingerprint.frame_count(), FRAMES);
            assert_eq!(fingerprint.to_key().len(), 3 * FRAMES);
        }
        other => panic!("Expected a crash, got {other:?}"),
    }
}

#[test]
#[serial]
fn hung_target_times_out() {
    signals::install().unwrap();
    let dir = tempdir().unwrap();
    let entry = input(dir.path(), "slow", b"");

    let mut executor = PtraceExecutor::new(&config(100, "/bin/sleep", &["5"]));
    let start = Instant::now();
    assert_eq!(executor.execute(&entry).unwrap(), RunResult::TimedOut);
    assert!(start.elapsed() < Duration::from_secs(4));

    // The next run starts with a fresh timeout flag.
    let quick = input(dir.path(), "quick", b"");
    let mut executor = PtraceExecutor::new(&config(2000, "/bin/true", &[]));
    assert_eq!(executor.execute(&quick).unwrap(), RunResult::Clean);
}

#[test]
#[serial]
fn stdin_delivery_feeds_the_input() {
    signals::install().unwrap();
    let dir = tempdir().unwrap();
    let crashing = input(dir.path(), "crashing", b"BAD\n");
    let benign = input(dir.path(), "benign", b"fine\n");

    let script = "read line; [ \"$line\" = BAD ] && kill -SEGV $$; exit 0";
    let mut executor = PtraceExecutor::new(&config(2000, "/bin/sh", &["-c", script]));
    assert!(matches!(
        executor.execute(&crashing).unwrap(),
        RunResult::Crashed(_)
    ));
    assert_eq!(executor.execute(&benign).unwrap(), RunResult::Clean);
}

#[test]
#[serial]
fn missing_program_is_fatal() {
    signals::install().unwrap();
    let dir = tempdir().unwrap();
    let entry = input(dir.path(), "in", b"x");

    let mut executor = PtraceExecutor::new(&config(2000, "/no/such/target", &["@@"]));
    assert!(executor.execute(&entry).is_err());
}

#[test]
#[serial]
fn batch_buckets_crashes_and_skips_clean_inputs() {
    signals::install().unwrap();
    let inputs = tempdir().unwrap();
    let out = tempdir().unwrap();
    fs::write(inputs.path().join("a"), b"BAD").unwrap();
    fs::write(inputs.path().join("b"), b"fine").unwrap();
    fs::write(inputs.path().join("c"), b"BAD").unwrap();

    let script = "read line < \"$0\"; [ \"$line\" = BAD ] && kill -SEGV $$; exit 0";
    let config = config(2000, "/bin/sh", &["-c", script, "@@"]);
    let entries = scan_input_dir(inputs.path()).unwrap();
    let root = OutputRoot::create_locked(out.path()).unwrap();
    let mut driver = BatchDriver::new(PtraceExecutor::new(&config), root, FRAMES)
        .with_stop_check(signals::stop_requested);

    let summary = driver.run(&entries).unwrap();
    assert_eq!(summary.processed, 3);
    assert_eq!(summary.crashed, 2);
    assert_eq!(summary.clean, 1);
    // Both crashes take the same path through the shell.
    assert_eq!(summary.buckets.len(), 1);

    let mut bucketed = Vec::new();
    for bucket in &summary.buckets {
        assert_eq!(bucket.len(), 3 * FRAMES);
        for copy in fs::read_dir(out.path().join(bucket)).unwrap() {
            bucketed.push(copy.unwrap().file_name().into_string().unwrap());
        }
    }
    bucketed.sort();
    assert_eq!(bucketed, vec!["a".to_string(), "c".to_string()]);
}

/// Target compiled with frame pointers. The first input byte picks the path:
/// `T` traps (SIGILL), `N` reads through a null pointer (SIGSEGV), anything
/// else exits cleanly.
const FRAME_TARGET_SOURCE: &str = r#"
#include <stdio.h>

static volatile int sink;

__attribute__((noinline)) static void trap_here(void) { __builtin_trap(); }

__attribute__((noinline)) static void read_null(void) { sink = *(volatile int *)0; }

__attribute__((noinline)) static void dispatch(int c) {
    if (c == 'T')
        trap_here();
    else if (c == 'N')
        read_null();
    sink = c;
}

__attribute__((noinline)) static void parse(FILE *f) { dispatch(fgetc(f)); }

int main(int argc, char **argv) {
    if (argc < 2)
        return 2;
    FILE *f = fopen(argv[1], "rb");
    if (!f)
        return 2;
    parse(f);
    fclose(f);
    return 0;
}
"#;

/// Builds the frame-pointer target with the system C compiler, or returns
/// `None` when no compiler is available.
fn build_frame_target(dir: &Path) -> Option<PathBuf> {
    let source = dir.join("frames.c");
    let binary = dir.join("frames");
    fs::write(&source, FRAME_TARGET_SOURCE).unwrap();

    let status = Command::new("cc")
        .args(["-O0", "-g0", "-fno-omit-frame-pointer", "-o"])
        .arg(&binary)
        .arg(&source)
        .status();
    match status {
        Ok(status) if status.success() => Some(binary),
        other => {
            eprintln!("Skipping frame-pointer test, cc unavailable: {other:?}");
            None
        }
    }
}

fn crash_fingerprint(result: RunResult) -> Fingerprint {
    match result {
        RunResult::Crashed(fingerprint) => fingerprint,
        other => panic!("Expected a crash, got {other:?}"),
    }
}

#[test]
#[serial]
fn frame_pointer_walk_reads_real_frames() {
    signals::install().unwrap();
    let dir = tempdir().unwrap();
    let Some(target) = build_frame_target(dir.path()) else {
        return;
    };
    let entry = input(dir.path(), "null", b"N");
    let mut executor = PtraceExecutor::new(&config(2000, &target, &["@@"]));

    let first = crash_fingerprint(executor.execute(&entry).unwrap());
    assert_eq!(first.frame_count(), FRAMES);
    assert!(!first.is_unresolved(), "no frame was readable: {first}");
    // The innermost frame is the return into `dispatch`, inside the target.
    assert!(matches!(first.frames().last(), Some(FrameId::Offset(_))));

    for _ in 0..2 {
        let again = crash_fingerprint(executor.execute(&entry).unwrap());
        assert_eq!(again, first);
    }
}

#[test]
#[serial]
fn different_fault_paths_get_different_fingerprints() {
    signals::install().unwrap();
    let dir = tempdir().unwrap();
    let Some(target) = build_frame_target(dir.path()) else {
        return;
    };
    let mut executor = PtraceExecutor::new(&config(2000, &target, &["@@"]));

    let trap = crash_fingerprint(executor.execute(&input(dir.path(), "trap", b"T")).unwrap());
    let null = crash_fingerprint(executor.execute(&input(dir.path(), "null", b"N")).unwrap());
    assert_ne!(trap.to_key(), null.to_key());
    assert_eq!(
        executor.execute(&input(dir.path(), "clean", b"C")).unwrap(),
        RunResult::Clean
    );
}

#[test]
#[serial]
fn batch_groups_frame_target_crashes_by_call_path() {
    signals::install().unwrap();
    let work = tempdir().unwrap();
    let Some(target) = build_frame_target(work.path()) else {
        return;
    };
    let inputs = tempdir().unwrap();
    let out = tempdir().unwrap();
    for (name, data) in [("a", "N"), ("b", "C"), ("c", "N"), ("d", "T")] {
        fs::write(inputs.path().join(name), data).unwrap();
    }

    let config = config(2000, &target, &["@@"]);
    let entries = scan_input_dir(inputs.path()).unwrap();
    let root = OutputRoot::create_locked(out.path()).unwrap();
    let mut driver = BatchDriver::new(PtraceExecutor::new(&config), root, FRAMES)
        .with_stop_check(signals::stop_requested);

    let summary = driver.run(&entries).unwrap();
    assert_eq!(summary.crashed, 3);
    assert_eq!(summary.clean, 1);
    assert_eq!(summary.buckets.len(), 2);

    let mut groups: Vec<Vec<String>> = summary
        .buckets
        .iter()
        .map(|bucket| {
            let mut names: Vec<String> = fs::read_dir(out.path().join(bucket))
                .unwrap()
                .map(|copy| copy.unwrap().file_name().into_string().unwrap())
                .collect();
            names.sort();
            names
        })
        .collect();
    groups.sort();
    assert_eq!(
        groups,
        vec![vec!["a".to_string(), "c".to_string()], vec!["d".to_string()]]
    );
}
