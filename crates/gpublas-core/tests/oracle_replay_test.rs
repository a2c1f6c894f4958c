use gpublas_core::{GpuBlas, GpuBlasBuilder, HostRuntime};
use gpublas_membrane::{CallSite, ExcludedRegions, LogEvent, Logger, MemoryLog, OracleEntry};
use std::path::PathBuf;
use std::sync::Arc;

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("gpublas-it-{}-{name}", std::process::id()))
}

fn session(options: &str) -> (GpuBlas, Arc<HostRuntime>, MemoryLog) {
    let rt = Arc::new(HostRuntime::new());
    let (logger, log) = Logger::memory();
    let gpublas = GpuBlasBuilder::new()
        .options_str(options)
        .expect("options")
        .runtime(rt.clone())
        .logger(Arc::new(logger))
        .regions(ExcludedRegions::empty())
        .build()
        .expect("session");
    (gpublas, rt, log)
}

/// Allocate once per `sites` entry and return the placement each object got.
fn run(gpublas: &GpuBlas, sites: &[CallSite]) -> Vec<bool> {
    let mut placed = Vec::new();
    let mut live = Vec::new();
    for &site in sites {
        let p = gpublas.interceptor().allocate(64, site).expect("allocate");
        let info = gpublas
            .registry()
            .lookup(p.as_ptr() as usize)
            .expect("tracked");
        placed.push(info.is_device_visible());
        live.push((p, site));
    }
    for (p, site) in live {
        unsafe { gpublas.interceptor().release(p.as_ptr(), site) };
    }
    placed
}

#[test]
fn oracle_replay_reproduces_recorded_decisions_in_order() {
    let recorded = [
        OracleEntry { call_site: CallSite(0x10), size: Some(64), device: true },
        OracleEntry { call_site: CallSite(0x20), size: Some(64), device: false },
        OracleEntry { call_site: CallSite(0x10), size: Some(64), device: false },
        OracleEntry { call_site: CallSite(0x20), size: Some(64), device: true },
        OracleEntry { call_site: CallSite(0x10), size: Some(64), device: true },
    ];
    let text: String = recorded
        .iter()
        .map(|e| serde_json::to_string(e).expect("entry") + "\n")
        .collect();
    let path = temp_path("oracle.jsonl");
    std::fs::write(&path, text).expect("write trace");

    let sites: Vec<CallSite> = recorded.iter().map(|e| e.call_site).collect();
    let expected: Vec<bool> = recorded.iter().map(|e| e.device).collect();
    let options = format!("heuristic=oracle:{}", path.display());

    // Two independent sessions over the same trace agree with the recording
    // and with each other.
    let (first, _rt1, _log1) = session(&options);
    let (second, _rt2, _log2) = session(&options);
    assert_eq!(run(&first, &sites), expected);
    assert_eq!(run(&second, &sites), expected);

    // Past the end of a site's sequence its last decision repeats; unknown
    // sites stay on the host.
    assert_eq!(run(&first, &[CallSite(0x10), CallSite(0x99)]), vec![true, false]);

    std::fs::remove_file(&path).expect("cleanup");
}

#[test]
fn trace_copy_line_reports_sixteen_bytes_host_to_device() {
    let (gpublas, _rt, log) = session("trace_copy;heuristic=false");
    let site = CallSite(0x4005d6);
    let x = gpublas.interceptor().allocate(4 * 4, site).expect("allocate");

    let mut call = gpublas.call();
    unsafe { call.place(x.as_ptr(), 16) }.expect("place");
    call.finish().expect("finish");
    unsafe { gpublas.interceptor().release(x.as_ptr(), site) };

    let snap = gpublas.metrics();
    assert_eq!(snap.misses, 1);
    assert_eq!(snap.hits, 0);

    let copy_lines: Vec<String> = log
        .lines()
        .into_iter()
        .filter(|line| {
            serde_json::from_str::<LogEvent>(line).is_ok_and(|event| event.event == "copy")
        })
        .collect();
    assert_eq!(copy_lines.len(), 1);
    let event: serde_json::Value = serde_json::from_str(&copy_lines[0]).expect("json");
    assert_eq!(event["bytes"], 16);
    assert_eq!(event["direction"], "host_to_device");
    assert_eq!(event["message"], "16 B : CPU ---> GPU");
}

#[test]
fn stats_report_is_written_on_shutdown() {
    let path = temp_path("stats.csv");
    let (gpublas, _rt, _log) = session(&format!("heuristic=true;stats={}", path.display()));
    let site = CallSite(0x30);
    let y = gpublas.interceptor().allocate(32, site).expect("allocate");
    let host = [7u8; 32];

    let mut call = gpublas.call();
    unsafe {
        call.place(host.as_ptr(), 32).expect("miss");
        call.place_output(y.as_ptr(), 32).expect("hit");
    }
    call.finish().expect("finish");
    unsafe { gpublas.interceptor().release(y.as_ptr(), site) };

    gpublas.shutdown();
    let report = std::fs::read_to_string(&path).expect("report");
    assert_eq!(report, "Hits,Misses\n1,1\n");
    std::fs::remove_file(&path).expect("cleanup");
}
