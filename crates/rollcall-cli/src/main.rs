use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;

#[zbus::proxy(
    interface = "org.rollcall.Rollcall1",
    default_service = "org.rollcall.Rollcall1",
    default_path = "/org/rollcall/Rollcall1"
)]
trait Rollcall {
    async fn register_student(&self, name: &str, photo_path: &str) -> zbus::Result<String>;
    async fn register_student_from_camera(&self, name: &str) -> zbus::Result<String>;
    async fn start_capture(&self) -> zbus::Result<()>;
    async fn recognize(&self) -> zbus::Result<String>;
    async fn cancel_capture(&self) -> zbus::Result<()>;
    async fn mark_attendance(&self, student_id: &str, status: &str) -> zbus::Result<String>;
    async fn list_students(&self) -> zbus::Result<String>;
    async fn list_attendance(&self, date: &str) -> zbus::Result<String>;
    async fn get_stats(&self) -> zbus::Result<String>;
    async fn export_attendance(&self, start_date: &str, end_date: &str) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a new student
    Register {
        /// Student display name
        name: String,
        /// Photo file to register with (enables recognition)
        #[arg(short, long)]
        photo: Option<PathBuf>,
        /// Take the photo with the camera instead of a file
        #[arg(long, conflicts_with = "photo")]
        capture: bool,
    },
    /// Start the camera and recognize the face in front of it
    Scan,
    /// Recognize again on an already-active capture session
    Recognize,
    /// Cancel an active capture session and release the camera
    Cancel,
    /// Mark attendance for a student (present, absent, or late)
    Mark {
        /// Student ID
        student_id: String,
        /// Status: present, absent, or late
        status: String,
    },
    /// List enrolled students
    Students,
    /// List attendance records
    Attendance {
        /// Only show records for this date (YYYY-MM-DD)
        #[arg(short, long)]
        date: Option<String>,
    },
    /// Show today's attendance stats
    Stats,
    /// Export attendance for a date range as CSV
    Export {
        /// Start date (YYYY-MM-DD, inclusive)
        start: String,
        /// End date (YYYY-MM-DD, inclusive)
        end: String,
        /// Output file (default: attendance_<start>_to_<end>.csv)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Show daemon status
    Status,
    /// Run camera diagnostics (bypasses the daemon)
    Test {
        /// V4L2 device to test
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
    },
}

fn print_recognition(json: &str) -> Result<()> {
    let outcome: Value = serde_json::from_str(json).context("bad recognition payload")?;
    if outcome["matched"].as_bool().unwrap_or(false) {
        let name = outcome["name"].as_str().unwrap_or("?");
        let id = outcome["student_id"].as_str().unwrap_or("?");
        let similarity = outcome["similarity"].as_f64().unwrap_or(0.0);
        println!("Recognized: {name} (similarity {similarity:.2})");
        println!("Mark attendance with: rollcall mark {id} present");
    } else {
        println!("No enrolled student matched.");
        println!("The camera is still on — try `rollcall recognize` again,");
        println!("mark manually with `rollcall mark <id> <status>`, or `rollcall cancel`.");
    }
    Ok(())
}

fn print_students(json: &str) -> Result<()> {
    let students: Vec<Value> = serde_json::from_str(json).context("bad student list payload")?;
    if students.is_empty() {
        println!("No students enrolled");
        return Ok(());
    }
    for s in &students {
        let enrolled = if s["features"].is_array() { "yes" } else { "no" };
        println!(
            "{}  {}  (face enrolled: {})",
            s["id"].as_str().unwrap_or("?"),
            s["name"].as_str().unwrap_or("?"),
            enrolled
        );
    }
    Ok(())
}

fn print_attendance(json: &str) -> Result<()> {
    let entries: Vec<Value> = serde_json::from_str(json).context("bad attendance payload")?;
    if entries.is_empty() {
        println!("No attendance records");
        return Ok(());
    }
    for e in &entries {
        println!(
            "{} {}  {}  {}",
            e["date"].as_str().unwrap_or("?"),
            e["time"].as_str().unwrap_or("?"),
            e["student_name"].as_str().unwrap_or("?"),
            e["status"].as_str().unwrap_or("?")
        );
    }
    Ok(())
}

fn print_stats(json: &str) -> Result<()> {
    let stats: Value = serde_json::from_str(json).context("bad stats payload")?;
    println!("Total students:  {}", stats["total_students"]);
    println!("Present today:   {}", stats["present_today"]);
    println!("Late today:      {}", stats["late_today"]);
    println!("Absent today:    {}", stats["absent_today"]);
    println!("Attendance rate: {}%", stats["attendance_rate"]);
    Ok(())
}

fn run_camera_test(device: &str) -> Result<()> {
    use rollcall_hw::CaptureSession;

    println!("Available capture devices:");
    for info in CaptureSession::list_devices() {
        println!("  {}  {} ({})", info.path, info.name, info.driver);
    }

    println!("Opening {device}...");
    let session = CaptureSession::open(device, 4).context("failed to open camera")?;
    println!(
        "Negotiated {}x{} {:?}",
        session.width, session.height, session.fourcc
    );

    let frame = session.grab().context("failed to capture frame")?;
    println!("Captured frame: avg luma {:.1}", frame.avg_luma());
    if rollcall_hw::frame::is_dark_frame(&frame.data, 0.95) {
        println!("Warning: frame is dark — check lighting or lens cover");
    }

    let image = image::RgbaImage::from_raw(frame.width, frame.height, frame.data)
        .context("captured frame is not a valid image")?;
    let out = "rollcall-test-frame.png";
    image.save(out).context("failed to save test frame")?;
    println!("Saved test frame to {out}");

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        // Camera diagnostics talk to the hardware directly; everything
        // else goes through the daemon.
        Commands::Test { device } => run_camera_test(&device),
        command => run_daemon_command(command).await,
    }
}

async fn run_daemon_command(command: Commands) -> Result<()> {
    let conn = zbus::Connection::session()
        .await
        .context("cannot reach the session bus")?;
    let proxy = RollcallProxy::new(&conn)
        .await
        .context("cannot reach rollcalld — is the daemon running?")?;

    match command {
        Commands::Register {
            name,
            photo,
            capture,
        } => {
            let json = if capture {
                println!("Look at the camera...");
                proxy.register_student_from_camera(&name).await?
            } else {
                let photo_path = match photo {
                    Some(p) => std::fs::canonicalize(&p)
                        .with_context(|| format!("photo not found: {}", p.display()))?
                        .to_string_lossy()
                        .into_owned(),
                    None => String::new(),
                };
                proxy.register_student(&name, &photo_path).await?
            };
            let student: Value = serde_json::from_str(&json)?;
            let enrolled = if student["features"].is_array() {
                "enrolled for recognition"
            } else {
                "no face features stored"
            };
            println!(
                "Registered {} ({}) — {}",
                student["name"].as_str().unwrap_or("?"),
                student["id"].as_str().unwrap_or("?"),
                enrolled
            );
        }
        Commands::Scan => {
            proxy.start_capture().await?;
            let json = proxy.recognize().await?;
            print_recognition(&json)?;
        }
        Commands::Recognize => {
            let json = proxy.recognize().await?;
            print_recognition(&json)?;
        }
        Commands::Cancel => {
            proxy.cancel_capture().await?;
            println!("Capture cancelled");
        }
        Commands::Mark { student_id, status } => {
            let json = proxy.mark_attendance(&student_id, &status).await?;
            let record: Value = serde_json::from_str(&json)?;
            println!(
                "Marked {} on {} at {}",
                record["status"].as_str().unwrap_or("?"),
                record["date"].as_str().unwrap_or("?"),
                record["time"].as_str().unwrap_or("?")
            );
        }
        Commands::Students => {
            let json = proxy.list_students().await?;
            print_students(&json)?;
        }
        Commands::Attendance { date } => {
            let json = proxy.list_attendance(date.as_deref().unwrap_or("")).await?;
            print_attendance(&json)?;
        }
        Commands::Stats => {
            let json = proxy.get_stats().await?;
            print_stats(&json)?;
        }
        Commands::Export { start, end, output } => {
            let csv = proxy.export_attendance(&start, &end).await?;
            let path = output
                .unwrap_or_else(|| PathBuf::from(format!("attendance_{start}_to_{end}.csv")));
            std::fs::write(&path, &csv)
                .with_context(|| format!("failed to write {}", path.display()))?;
            let rows = csv.lines().count().saturating_sub(1);
            println!("Exported {rows} records to {}", path.display());
        }
        Commands::Status => {
            let json = proxy.status().await?;
            let status: Value = serde_json::from_str(&json)?;
            println!("rollcalld {}", status["version"].as_str().unwrap_or("?"));
            println!("  capture:  {}", status["capture"].as_str().unwrap_or("?"));
            println!("  detector: {}", status["detector"].as_str().unwrap_or("?"));
            println!(
                "  camera:   {}",
                status["camera_device"].as_str().unwrap_or("?")
            );
            println!("  database: {}", status["db_path"].as_str().unwrap_or("?"));
        }
        // Dispatched before the bus connection is made.
        Commands::Test { .. } => {}
    }

    Ok(())
}
