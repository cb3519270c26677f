//! course-portal - command line client for the course enrollment portal.
//!
//! Usage:
//!   course-portal login admin --email-or-phone <id> --password <pw>
//!   course-portal login student --aadhaar-no <no> --password <pw>
//!   course-portal whoami | logout | registrations | profile [--student-id <id>]

use clap::{Parser, Subcommand};
use course_portal::{
    Credentials, FileStore, PortalApi, PortalConfig, PortalError, Registration,
    ReqwestTransport, Role, SessionManager,
};
use std::process::exit;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "course-portal")]
#[command(about = "Course enrollment portal client")]
struct Args {
    #[command(flatten)]
    config: PortalConfig,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Log in and persist the session
    Login {
        #[command(subcommand)]
        role: LoginAs,
    },
    /// Drop the persisted session
    Logout,
    /// Show the current session
    Whoami,
    /// Submit a new student registration
    Register {
        #[arg(long)]
        full_name: String,
        #[arg(long)]
        aadhaar_no: String,
        #[arg(long)]
        associate_wings: String,
        #[arg(long)]
        phone: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        district: String,
        #[arg(long)]
        block: String,
        #[arg(long)]
        state: String,
        #[arg(long)]
        password: String,
    },
    /// List all enrollments (admin)
    Registrations,
    /// Show an enrollment record; defaults to the logged-in student
    Profile {
        #[arg(long)]
        student_id: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum LoginAs {
    Admin {
        #[arg(long)]
        email_or_phone: String,
        #[arg(long)]
        password: String,
    },
    Student {
        #[arg(long)]
        aadhaar_no: String,
        #[arg(long)]
        password: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        eprintln!("Error: {}", e);
        if matches!(e, PortalError::Refresh(_) | PortalError::Access(_)) {
            eprintln!("Run `course-portal login` to start a new session.");
        }
        exit(1);
    }
}

async fn run(args: Args) -> Result<(), PortalError> {
    let config = args.config;
    let transport = ReqwestTransport::new(config.base_url.clone(), config.timeout)?;
    let store = FileStore::open(&config.session_file)?;
    let manager = Arc::new(SessionManager::new(Arc::new(transport), Arc::new(store)));
    let api = PortalApi::new(manager.clone());

    match args.command {
        Commands::Login { role } => {
            let credentials = match role {
                LoginAs::Admin {
                    email_or_phone,
                    password,
                } => Credentials::Admin {
                    email_or_phone,
                    password,
                },
                LoginAs::Student {
                    aadhaar_no,
                    password,
                } => Credentials::Student {
                    aadhaar_no,
                    password,
                },
            };
            let session = manager.login(credentials).await?;
            println!(
                "Logged in as {} {}",
                session.role.map(Role::as_str).unwrap_or("unknown"),
                session.subject_id.as_deref().unwrap_or("-")
            );
        }
        Commands::Logout => {
            manager.logout();
            println!("Logged out");
        }
        Commands::Whoami => {
            let session = manager.session();
            if session.is_authenticated() {
                println!(
                    "{} {}",
                    session.role.map(Role::as_str).unwrap_or("unknown"),
                    session.subject_id.as_deref().unwrap_or("-")
                );
            } else {
                println!("Not logged in");
            }
        }
        Commands::Register {
            full_name,
            aadhaar_no,
            associate_wings,
            phone,
            email,
            district,
            block,
            state,
            password,
        } => {
            let form = Registration {
                full_name,
                aadhaar_no,
                associate_wings,
                phone,
                email,
                district,
                block,
                state,
                confirm_password: password.clone(),
                password,
            };
            api.register(&form).await?;
            println!("Registration Successful");
        }
        Commands::Registrations => {
            let records = api.registrations().await?;
            info!(count = records.len(), "Listing registrations");
            print_json(&records)?;
        }
        Commands::Profile { student_id } => {
            let record = match student_id {
                Some(id) => api.registration(&id).await?,
                None => api.my_registration().await?,
            };
            print_json(&record)?;
        }
    }
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), PortalError> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|e| PortalError::Api(format!("render output: {}", e)))?;
    println!("{}", rendered);
    Ok(())
}
