use std::process::exit;

use server::{config::store_vars_present, error::ServerError, start_server};

#[tokio::main]
async fn main() {
    if let Err(e) = start_server().await {
        eprintln!("FATAL: {e}");

        if let ServerError::Config(_) = e {
            eprintln!("Store related variables set: {:?}", store_vars_present());
        }

        exit(1);
    }
}
