use std::path::{Path, PathBuf};

use oomwatch_config::OomwatchConfig;
use oomwatch_host::{cgroup, read_pressure, PressureLevel, PressureSnapshot, PressureThresholds};
use serde::Serialize;
use sysinfo::{MemoryRefreshKind, RefreshKind, System};

#[derive(Debug, Serialize)]
pub(crate) struct StatusReport {
    pub config_path: Option<PathBuf>,
    pub marker_path: PathBuf,
    pub marker_present: bool,
    pub pressure: Option<PressureReport>,
    pub cgroup_pressure: Option<PressureReport>,
    pub cgroup_memory_limit_bytes: Option<u64>,
    pub memory: MemoryTotals,
}

#[derive(Debug, Serialize)]
pub(crate) struct PressureReport {
    pub path: PathBuf,
    pub level: PressureLevel,
    #[serde(flatten)]
    pub snapshot: PressureSnapshot,
}

#[derive(Debug, Serialize)]
pub(crate) struct MemoryTotals {
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub used_bytes: u64,
    pub swap_total_bytes: u64,
    pub swap_free_bytes: u64,
}

pub(crate) fn collect(config: &OomwatchConfig, config_path: Option<PathBuf>) -> StatusReport {
    let marker_path = config.watchdog.marker_path.clone();
    let marker_present = oomwatch_memory::marker_exists(&marker_path);

    StatusReport {
        config_path,
        marker_path,
        marker_present,
        pressure: pressure_report(Path::new(oomwatch_host::PROC_PRESSURE_MEMORY)),
        cgroup_pressure: cgroup::own_memory_pressure_path()
            .and_then(|path| pressure_report(&path)),
        cgroup_memory_limit_bytes: cgroup::own_memory_limit_bytes(),
        memory: memory_totals(),
    }
}

fn pressure_report(path: &Path) -> Option<PressureReport> {
    let snapshot = read_pressure(path)?;
    Some(PressureReport {
        path: path.to_path_buf(),
        level: snapshot.level(PressureThresholds::default()),
        snapshot,
    })
}

fn memory_totals() -> MemoryTotals {
    let sys = System::new_with_specifics(
        RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
    );
    MemoryTotals {
        total_bytes: sys.total_memory(),
        available_bytes: sys.available_memory(),
        used_bytes: sys.used_memory(),
        swap_total_bytes: sys.total_swap(),
        swap_free_bytes: sys.free_swap(),
    }
}

pub(crate) fn print_human(report: &StatusReport) {
    match &report.config_path {
        Some(path) => println!("config: {}", path.display()),
        None => println!("config: (none, using defaults)"),
    }
    println!("marker:");
    println!("  path: {}", report.marker_path.display());
    println!("  present: {}", report.marker_present);

    for (label, pressure) in [
        ("pressure", &report.pressure),
        ("cgroup_pressure", &report.cgroup_pressure),
    ] {
        let Some(pressure) = pressure else {
            println!("{label}: (unavailable)");
            continue;
        };
        println!("{label}: {}", pressure.path.display());
        println!("  level: {:?}", pressure.level);
        let some = &pressure.snapshot.some;
        println!(
            "  some: avg10={:.2} avg60={:.2} avg300={:.2} total_us={}",
            some.avg10, some.avg60, some.avg300, some.total_us
        );
        if let Some(full) = &pressure.snapshot.full {
            println!(
                "  full: avg10={:.2} avg60={:.2} avg300={:.2} total_us={}",
                full.avg10, full.avg60, full.avg300, full.total_us
            );
        }
    }

    if let Some(limit) = report.cgroup_memory_limit_bytes {
        println!("cgroup_memory_limit_bytes: {limit}");
    }
    let memory = &report.memory;
    println!("memory:");
    println!("  total_bytes: {}", memory.total_bytes);
    println!("  available_bytes: {}", memory.available_bytes);
    println!("  used_bytes: {}", memory.used_bytes);
    println!("  swap_total_bytes: {}", memory.swap_total_bytes);
    println!("  swap_free_bytes: {}", memory.swap_free_bytes);
}
