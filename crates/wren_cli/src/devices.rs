use anyhow::Result;

use wren_engine::device;

pub fn run() -> Result<()> {
    println!("--- Available Devices ---");
    for info in device::detect_all() {
        let memory = if info.memory_total > 0 {
            format!(
                ", {:.1} / {:.1} GiB free",
                info.memory_available as f64 / (1 << 30) as f64,
                info.memory_total as f64 / (1 << 30) as f64
            )
        } else {
            String::new()
        };
        println!("{:8} {}{}", info.device_string(), info.name, memory);
    }
    Ok(())
}
