mod common;

use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{TimeZone, Utc};

use common::{refused_url, ScriptedRunner, Step};
use photo_logger::{GpsClockSync, GpsSyncSettings, Shutdown};

/// Minimal gpsd: waits for `?WATCH`, then plays `chunks` with a pause
/// between each, then holds the session open.
fn fake_gpsd(chunks: Vec<(&'static str, Duration)>) -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind gpsd");
    let addr = listener.local_addr().expect("gpsd addr").to_string();
    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept");
        let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));
        let mut watch = String::new();
        reader.read_line(&mut watch).expect("read watch");

        let mut stream = stream;
        stream
            .write_all(b"{\"class\":\"VERSION\",\"release\":\"3.22\",\"proto_major\":3}\n")
            .expect("write version");
        for (chunk, pause) in chunks {
            thread::sleep(pause);
            if stream.write_all(chunk.as_bytes()).is_err() {
                break;
            }
        }
        thread::sleep(Duration::from_millis(500));
        watch
    });
    (addr, handle)
}

fn settings(addr: String, dry_run: bool) -> GpsSyncSettings {
    GpsSyncSettings {
        gpsd_addr: addr,
        dry_run,
        ..GpsSyncSettings::default()
    }
}

#[test]
fn dry_run_reports_first_usable_fix_across_split_reads() {
    let (addr, gpsd) = fake_gpsd(vec![
        (
            "{\"class\":\"TPV\",\"mode\":1,\"time\":\"2025-03-14T09:26:50.000Z\"}\n",
            Duration::from_millis(100),
        ),
        ("{\"class\":\"TPV\",\"mode\":3,", Duration::from_millis(100)),
        // Longer than the client's read timeout.
        (
            "\"time\":\"2025-03-14T09:26:53.000Z\"}\n",
            Duration::from_millis(1300),
        ),
    ]);
    let runner = ScriptedRunner::default();
    let mut sync = GpsClockSync::new(
        settings(addr, true),
        Box::new(runner.clone()),
        Shutdown::new(),
    );

    let applied = sync.run_once(Duration::from_secs(10));

    assert_eq!(
        applied,
        Utc.with_ymd_and_hms(2025, 3, 14, 9, 26, 53).single()
    );
    assert!(runner.calls().is_empty());
    let watch = gpsd.join().expect("gpsd thread");
    assert!(watch.starts_with("?WATCH="));
    assert!(watch.contains("\"json\":true"));
}

#[test]
fn fix_sets_system_clock_then_writes_rtc() {
    let (addr, _gpsd) = fake_gpsd(vec![(
        "{\"class\":\"TPV\",\"mode\":2,\"time\":\"2025-03-14T09:26:53.250Z\"}\n",
        Duration::from_millis(50),
    )]);
    let runner = ScriptedRunner::new(vec![Step::ok(""), Step::ok("")]);
    let mut sync = GpsClockSync::new(
        settings(addr, false),
        Box::new(runner.clone()),
        Shutdown::new(),
    );

    assert!(sync.run_once(Duration::from_secs(5)).is_some());

    let calls = runner.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].program, "sudo");
    assert_eq!(calls[0].args, vec!["date", "-u", "-s", "2025-03-14 09:26:53"]);
    assert_eq!(calls[1].program, "sudo");
    assert_eq!(calls[1].args, vec!["hwclock", "-w"]);
}

#[test]
fn failed_date_skips_rtc_write() {
    let (addr, _gpsd) = fake_gpsd(vec![(
        "{\"class\":\"TPV\",\"mode\":3,\"time\":\"2025-03-14T09:26:53Z\"}\n",
        Duration::from_millis(50),
    )]);
    let runner = ScriptedRunner::new(vec![Step::fail(1)]);
    let mut sync = GpsClockSync::new(
        GpsSyncSettings {
            use_sudo: false,
            ..settings(addr, false)
        },
        Box::new(runner.clone()),
        Shutdown::new(),
    );

    assert!(sync.run_once(Duration::from_secs(5)).is_none());
    let calls = runner.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].program, "date");
}

#[test]
fn no_gpsd_gives_up_at_the_timeout() {
    let addr = refused_url()
        .trim_start_matches("http://")
        .trim_end_matches("/upload")
        .to_string();
    let runner = ScriptedRunner::default();
    let mut sync = GpsClockSync::new(settings(addr, false), Box::new(runner.clone()), Shutdown::new());

    let started = Instant::now();
    assert!(sync.run_once(Duration::from_secs(2)).is_none());
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_secs(2));
    assert!(elapsed < Duration::from_secs(5), "took {:?}", elapsed);
    assert!(runner.calls().is_empty());
}
