//! Host telemetry behind the `/info` routes.
//!
//! CPU, memory, disk and network figures come from `sysinfo`; board identity
//! from `/proc/cpuinfo`. The Raspberry Pi firmware readings (`vcgencmd`) and
//! the USB listing (`lsusb`) need the respective tool on the search path.
//! Individual readings that fail are logged and left out of the report.

use std::ffi::OsStr;
use std::fs;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::thread;

use log::warn;
use regex::Regex;
use serde::Serialize;
use sysinfo::{
    CpuRefreshKind, Disks, MINIMUM_CPU_UPDATE_INTERVAL, MemoryRefreshKind, Networks, RefreshKind,
    System,
};

use crate::error::AppError;
use crate::topology::{find_executable, run_tool};

const READING_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const CPU_TEMP_PATH: &str = "/sys/class/thermal/thermal_zone0/temp";

static LSUSB_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Bus (\d+) Device (\d+): ID ([0-9a-fA-F]+):([0-9a-fA-F]+)\s*(.*)$").unwrap()
});
static MEM_SIZE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)([MGK])").unwrap());

fn reading_date() -> String {
    chrono::Local::now().format(READING_DATE_FORMAT).to_string()
}

fn logged<T>(what: &str, result: Result<T, AppError>) -> Option<T> {
    result.map_err(|e| warn!("telemetry: {what}: {e}")).ok()
}

/// Board identity fields from `/proc/cpuinfo`.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct BoardInfo {
    #[serde(rename = "cpu_revision", skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(rename = "cpu_serial", skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    #[serde(rename = "cpu_model", skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// First value of each interesting `key : value` pair.
pub fn parse_cpuinfo(text: &str) -> BoardInfo {
    let mut board = BoardInfo::default();
    for (key, value) in text.lines().filter_map(|l| l.split_once(':')) {
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        let slot = match key.trim() {
            "Revision" => &mut board.revision,
            "Serial" => &mut board.serial,
            "model name" => &mut board.model,
            _ => continue,
        };
        slot.get_or_insert_with(|| value.to_string());
    }
    board
}

/// Marketing name for a Raspberry Pi revision code.
pub fn device_name(revision: &str) -> Option<&'static str> {
    let name = match revision {
        "900021" | "900092" | "920092" | "900093" | "920093" => "Raspberry Pi Zero",
        "900032" | "9000c1" => "Raspberry Pi Zero W",
        "9020e0" | "9020e1" => "Raspberry Pi 3 Model A+",
        "a01040" | "a01041" | "a21041" => "Raspberry Pi 2 Model B",
        "a02042" | "a22042" => "Raspberry Pi 2 Model B (with BCM2837)",
        "a02082" | "a22082" | "a32082" | "a52082" => "Raspberry Pi 3 Model B",
        "a020d3" | "a22083" | "a020d4" => "Raspberry Pi 3 Model B+",
        "a020a0" | "a220a0" => "Raspberry Pi Compute Module 3",
        "a02100" => "Raspberry Pi Compute Module 3+",
        "a03111" | "b03111" | "c03111" | "b03112" | "c03112" | "b03114" | "c03114" | "b03115"
        | "c03115" => "Raspberry Pi 4 Model B",
        "c03130" => "Raspberry Pi 400",
        "a03140" | "b03140" | "c03140" | "d03140" => "Raspberry Pi Compute Module 4",
        "902120" => "Raspberry Pi Zero 2 W",
        "c04170" | "d04170" => "Raspberry Pi 5",
        _ => return None,
    };
    Some(name)
}

const THROTTLE_EVENTS: [(u32, &str); 8] = [
    (1 << 0, "Under-voltage detected"),
    (1 << 1, "Frequency capped"),
    (1 << 2, "Throttling"),
    (1 << 3, "Soft temperature limit active"),
    (1 << 16, "Under-voltage occurred"),
    (1 << 17, "Frequency cap occurred"),
    (1 << 18, "Throttling occurred"),
    (1 << 19, "Soft temperature limit occurred"),
];

/// Human readable events set in a `get_throttled` bit mask.
pub fn throttled_events(bits: u32) -> Vec<&'static str> {
    THROTTLE_EVENTS
        .iter()
        .filter(|(flag, _)| bits & flag != 0)
        .map(|(_, event)| *event)
        .collect()
}

/// Text after the last `=` of a `vcgencmd` reply, without `suffix`.
fn vc_value<'a>(output: &'a str, suffix: &str) -> Result<&'a str, AppError> {
    let (_, value) = output
        .trim()
        .rsplit_once('=')
        .ok_or_else(|| AppError::Parse(format!("unexpected vcgencmd reply {output:?}")))?;
    let value = value.trim();
    Ok(value.strip_suffix(suffix).unwrap_or(value))
}

fn vc_number(output: &str, suffix: &str) -> Result<f64, AppError> {
    let value = vc_value(output, suffix)?;
    value
        .parse()
        .map_err(|e| AppError::Parse(format!("vcgencmd value {value:?}: {e}")))
}

pub fn parse_throttled(output: &str) -> Result<u32, AppError> {
    let value = vc_value(output, "")?;
    let hex = value.trim_start_matches("0x");
    u32::from_str_radix(hex, 16)
        .map_err(|e| AppError::Parse(format!("throttled value {value:?}: {e}")))
}

/// `arm=948M` style replies, keeping number and unit.
pub fn parse_mem_size(output: &str) -> Result<String, AppError> {
    MEM_SIZE
        .captures(output)
        .map(|caps| format!("{}{}", &caps[1], &caps[2]))
        .ok_or_else(|| AppError::Parse(format!("unexpected get_mem reply {output:?}")))
}

/// Firmware readings, present only when `vcgencmd` is installed.
#[derive(Debug, Default, Serialize, PartialEq)]
pub struct VcgencmdReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub core_voltage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_temp: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub throttled: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub throttled_info: Option<Vec<&'static str>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arm_mem: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_mem: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_freq_mhz: Option<f64>,
}

pub struct Vcgencmd {
    path: PathBuf,
}

impl Vcgencmd {
    pub const COMMAND: &'static str = "vcgencmd";

    pub fn find(search_path: &OsStr) -> Option<Self> {
        find_executable(Self::COMMAND, search_path).map(|path| Self { path })
    }

    fn query(&self, args: &[&str]) -> Result<String, AppError> {
        run_tool(Self::COMMAND, &self.path, args)
    }

    pub fn core_voltage(&self) -> Result<f64, AppError> {
        vc_number(&self.query(&["measure_volts", "core"])?, "V")
    }

    pub fn gpu_temp(&self) -> Result<f64, AppError> {
        vc_number(&self.query(&["measure_temp"])?, "'C")
    }

    pub fn throttled(&self) -> Result<u32, AppError> {
        parse_throttled(&self.query(&["get_throttled"])?)
    }

    pub fn mem(&self, which: &str) -> Result<String, AppError> {
        parse_mem_size(&self.query(&["get_mem", which])?)
    }

    pub fn arm_clock_mhz(&self) -> Result<f64, AppError> {
        Ok(vc_number(&self.query(&["measure_clock", "arm"])?, "")? / 1_000_000.0)
    }

    pub fn report(&self) -> VcgencmdReport {
        let throttled = logged("throttled status", self.throttled());
        VcgencmdReport {
            core_voltage: logged("core voltage", self.core_voltage()),
            gpu_temp: logged("GPU temperature", self.gpu_temp()),
            throttled,
            throttled_info: throttled.map(throttled_events),
            arm_mem: logged("ARM memory", self.mem("arm")),
            gpu_mem: logged("GPU memory", self.mem("gpu")),
            cpu_freq_mhz: logged("CPU frequency", self.arm_clock_mhz()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct LoadAverage {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

fn load_average() -> LoadAverage {
    let load = System::load_average();
    LoadAverage {
        one: load.one,
        five: load.five,
        fifteen: load.fifteen,
    }
}

/// Millidegrees from the first thermal zone, in degrees Celsius.
fn cpu_temp() -> Option<f64> {
    let raw = fs::read_to_string(CPU_TEMP_PATH).ok()?;
    let millis: f64 = raw.trim().parse().ok()?;
    Some(millis / 1000.0)
}

fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CpuCore {
    pub name: String,
    pub brand: String,
    pub vendor_id: String,
    pub frequency_mhz: u64,
    pub usage: f32,
}

#[derive(Debug, Serialize)]
pub struct CpuReport {
    pub reading_date: String,
    pub cpus: Vec<CpuCore>,
    pub load_average: LoadAverage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_temp: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_freq_mhz: Option<f64>,
}

fn cpu_cores() -> Vec<CpuCore> {
    let mut sys =
        System::new_with_specifics(RefreshKind::new().with_cpu(CpuRefreshKind::everything()));
    // usage is a delta between two refreshes
    thread::sleep(MINIMUM_CPU_UPDATE_INTERVAL);
    sys.refresh_cpu_usage();

    sys.cpus()
        .iter()
        .map(|cpu| CpuCore {
            name: cpu.name().to_string(),
            brand: cpu.brand().to_string(),
            vendor_id: cpu.vendor_id().to_string(),
            frequency_mhz: cpu.frequency(),
            usage: cpu.cpu_usage(),
        })
        .collect()
}

pub fn cpu_report(search_path: &OsStr) -> CpuReport {
    CpuReport {
        reading_date: reading_date(),
        cpus: cpu_cores(),
        load_average: load_average(),
        cpu_temp: cpu_temp(),
        cpu_freq_mhz: Vcgencmd::find(search_path)
            .and_then(|vc| logged("CPU frequency", vc.arm_clock_mhz())),
    }
}

/// Byte counts.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryUsage {
    pub total: u64,
    pub free: u64,
    pub available: u64,
    pub used: u64,
    pub used_percent: f64,
    pub swap_total: u64,
    pub swap_used: u64,
}

fn memory_usage() -> MemoryUsage {
    let sys = System::new_with_specifics(
        RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
    );
    MemoryUsage {
        total: sys.total_memory(),
        free: sys.free_memory(),
        available: sys.available_memory(),
        used: sys.used_memory(),
        used_percent: percent(sys.used_memory(), sys.total_memory()),
        swap_total: sys.total_swap(),
        swap_used: sys.used_swap(),
    }
}

#[derive(Debug, Serialize)]
pub struct MemoryReport {
    pub reading_date: String,
    pub memory: MemoryUsage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arm_mem: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_mem: Option<String>,
}

pub fn memory_report(search_path: &OsStr) -> MemoryReport {
    let (arm_mem, gpu_mem) = match Vcgencmd::find(search_path) {
        Some(vc) => (
            logged("ARM memory", vc.mem("arm")),
            logged("GPU memory", vc.mem("gpu")),
        ),
        None => (None, None),
    };
    MemoryReport {
        reading_date: reading_date(),
        memory: memory_usage(),
        arm_mem,
        gpu_mem,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DiskUsage {
    pub name: String,
    pub mount_point: String,
    pub file_system: String,
    pub total: u64,
    pub available: u64,
    pub used: u64,
    pub used_percent: f64,
}

fn disk_usage() -> Vec<DiskUsage> {
    Disks::new_with_refreshed_list()
        .iter()
        .map(|disk| {
            let total = disk.total_space();
            let available = disk.available_space();
            let used = total.saturating_sub(available);
            DiskUsage {
                name: disk.name().to_string_lossy().to_string(),
                mount_point: disk.mount_point().to_string_lossy().to_string(),
                file_system: disk.file_system().to_string_lossy().to_string(),
                total,
                available,
                used,
                used_percent: percent(used, total),
            }
        })
        .collect()
}

#[derive(Debug, Serialize)]
pub struct DiskReport {
    pub reading_date: String,
    pub disks: Vec<DiskUsage>,
}

pub fn disk_report() -> DiskReport {
    DiskReport {
        reading_date: reading_date(),
        disks: disk_usage(),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NetStat {
    pub interface: String,
    pub mac: String,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

fn net_stats() -> Vec<NetStat> {
    let mut stats: Vec<NetStat> = Networks::new_with_refreshed_list()
        .iter()
        .map(|(interface, data)| NetStat {
            interface: interface.clone(),
            mac: data.mac_address().to_string(),
            rx_bytes: data.total_received(),
            tx_bytes: data.total_transmitted(),
        })
        .collect();
    stats.sort_by(|a, b| a.interface.cmp(&b.interface));
    stats
}

#[derive(Debug, Serialize)]
pub struct NetReport {
    pub reading_date: String,
    pub network: Vec<NetStat>,
}

pub fn net_report() -> NetReport {
    NetReport {
        reading_date: reading_date(),
        network: net_stats(),
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct UsbDevice {
    pub bus: String,
    pub device: String,
    pub id: String,
    pub vendor: String,
    pub product: String,
    pub description: String,
}

pub fn parse_lsusb(output: &str) -> Vec<UsbDevice> {
    output
        .lines()
        .filter_map(|line| LSUSB_LINE.captures(line.trim()))
        .map(|caps| UsbDevice {
            bus: caps[1].to_string(),
            device: caps[2].to_string(),
            id: format!("{}:{}", &caps[3], &caps[4]),
            vendor: caps[3].to_string(),
            product: caps[4].to_string(),
            description: caps[5].to_string(),
        })
        .collect()
}

pub fn usb_devices(search_path: &OsStr) -> Result<Vec<UsbDevice>, AppError> {
    let path = find_executable("lsusb", search_path)
        .ok_or_else(|| AppError::ToolNotFound("lsusb command not found".into()))?;
    Ok(parse_lsusb(&run_tool("lsusb", &path, &[])?))
}

/// Everything `/info` reports in one document.
#[derive(Debug, Serialize)]
pub struct SystemOverview {
    pub reading_date: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_info: Option<&'static str>,
    #[serde(flatten)]
    pub board: BoardInfo,
    pub cpu_cores: usize,
    pub cpu_mhz: u64,
    pub uptime_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kernel: Option<String>,
    pub load_average: LoadAverage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_temp: Option<f64>,
    pub memory: MemoryUsage,
    pub disks: Vec<DiskUsage>,
    pub net_stat: Vec<NetStat>,
    #[serde(flatten)]
    pub vcgencmd: Option<VcgencmdReport>,
}

pub fn overview(search_path: &OsStr) -> SystemOverview {
    let mut board = fs::read_to_string("/proc/cpuinfo")
        .map(|text| parse_cpuinfo(&text))
        .unwrap_or_default();

    let sys = System::new_with_specifics(
        RefreshKind::new().with_cpu(CpuRefreshKind::new().with_frequency()),
    );
    let cpus = sys.cpus();
    if board.model.is_none() {
        board.model = cpus
            .first()
            .map(|c| c.brand().to_string())
            .filter(|b| !b.is_empty());
    }

    SystemOverview {
        reading_date: reading_date(),
        hostname: System::host_name(),
        device_info: board.revision.as_deref().and_then(device_name),
        cpu_cores: cpus.len(),
        cpu_mhz: cpus.first().map(|c| c.frequency()).unwrap_or(0),
        board,
        uptime_secs: System::uptime(),
        os_name: System::long_os_version(),
        kernel: System::kernel_version(),
        load_average: load_average(),
        cpu_temp: cpu_temp(),
        memory: memory_usage(),
        disks: disk_usage(),
        net_stat: net_stats(),
        vcgencmd: Vcgencmd::find(search_path).map(|vc| vc.report()),
    }
}
