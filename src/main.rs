// # CohortDB Server
//
// Entry point: parse arguments, initialize logging, build the services
// struct, recover persisted state, start the pool/sentinel/dispatcher
// and serve HTTP.

use cohortdb::{Config, Services, VERSION};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

fn usage() {
    println!(
        "cohortdb-server {VERSION}\n\
         \n\
         options:\n\
           --host <ip>        bind address (default 0.0.0.0)\n\
           --port <port>      bind port (default 8080)\n\
           --host_ext <name>  externally advertised host\n\
           --port_ext <port>  externally advertised port\n\
           --data <path>      data directory (default: in-memory only)\n\
           --test             start, self-check and exit"
    );
}

fn parse_args(config: &mut Config) -> Result<bool, String> {
    let mut test_mode = false;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        let mut value = |name: &str| {
            args.next()
                .ok_or_else(|| format!("{name} requires a value"))
        };
        match arg.as_str() {
            "--host" => config.host = value("--host")?,
            "--port" => {
                config.port = value("--port")?
                    .parse()
                    .map_err(|_| "bad --port".to_string())?
            }
            "--host_ext" => config.external_host = Some(value("--host_ext")?),
            "--port_ext" => {
                config.external_port = Some(
                    value("--port_ext")?
                        .parse()
                        .map_err(|_| "bad --port_ext".to_string())?,
                )
            }
            "--data" | "--path" => config.data_dir = Some(PathBuf::from(value("--data")?)),
            "--test" => test_mode = true,
            "--help" | "-h" => {
                usage();
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument '{other}'")),
        }
    }
    Ok(test_mode)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    let mut config = Config::default();
    let test_mode = match parse_args(&mut config) {
        Ok(test_mode) => test_mode,
        Err(message) => {
            error!("{message}");
            usage();
            return ExitCode::from(1);
        }
    };

    info!("cohortdb {VERSION} starting");
    if let Some(dir) = &config.data_dir {
        if let Err(e) = std::fs::create_dir_all(dir) {
            error!(error = %e, "cannot create data directory");
            return ExitCode::from(1);
        }
    }

    let services = Services::new(config);
    if let Err(e) = services.db.load_tables() {
        error!(error = %e, "failed loading persisted tables");
        return ExitCode::from(1);
    }
    services.start();

    if test_mode {
        // bring up one partition, write and read a row, then exit clean
        let ok = self_check(&services);
        services.stop();
        return if ok {
            info!("self check passed");
            ExitCode::SUCCESS
        } else {
            error!("self check failed");
            ExitCode::from(1)
        };
    }

    match cohortdb::server::serve(services.clone()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal");
            services.stop();
            ExitCode::from(1)
        }
    }
}

fn self_check(services: &std::sync::Arc<Services>) -> bool {
    use std::time::Duration;

    if services.init_cluster(4).is_err() {
        return false;
    }
    let Ok(table) = services.db.create_table("selfcheck") else {
        return false;
    };
    let row = serde_json::json!({
        "person": "probe@local",
        "stamp": 1,
        "_": { "event": "boot" }
    });
    let partition = cohortdb::cells::OpenLoopCustomer::home_partition("probe@local", 4);
    let Ok(bytes) = serde_json::to_vec(&row) else {
        return false;
    };
    if services.log.append("selfcheck", partition, &[bytes]).is_err() {
        return false;
    }

    // wait for the insert cell to drain the row
    for _ in 0..100 {
        std::thread::sleep(Duration::from_millis(100));
        let found = table
            .get_partition_objects(services, partition, false)
            .map(|parts| parts.lock().people.customer_count() > 0)
            .unwrap_or(false);
        if found {
            return true;
        }
    }
    false
}
