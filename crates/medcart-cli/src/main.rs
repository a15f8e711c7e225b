//! medcart - command line client for the medcart pharmacy storefront.
//!
//! Signs in once, keeps the session in the OS keychain (or a local file),
//! and reuses it across invocations, refreshing the access token as needed.

use std::io::{self, Write};

use anyhow::{bail, Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use medcart_core::api::client::DEFAULT_PAGE_SIZE;
use medcart_core::auth::AuthError;
use medcart_core::models::{NewOrder, Order, Registration, UserProfile};
use medcart_core::{ApiClient, ApiError, Config, SessionManager, StartupCheck};

// ============================================================================
// Constants
// ============================================================================

const USERNAME_ENV: &str = "MEDCART_USERNAME";
const PASSWORD_ENV: &str = "MEDCART_PASSWORD";

const USAGE: &str = "\
Usage: medcart <command> [args]

Commands:
  login [username]                      Sign in and remember the session
  register <username> <email> [first] [last]
                                        Create an account and sign in
  logout                                Sign out and forget the session
  whoami                                Show the signed-in user
  products [page]                       List products
  branches                              List pharmacy branches
  orders [page]                         Show your order history
  order <branch> <product:qty>...       Place an order

Environment:
  MEDCART_API_URL, MEDCART_USERNAME, MEDCART_PASSWORD, RUST_LOG";

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        eprintln!("{}", USAGE);
        return Ok(());
    };

    let mut config = Config::load()?;
    let session = config.session_manager()?;
    let client = ApiClient::new(session.clone());
    info!(command = %command, "medcart starting");

    let result = match command.as_str() {
        "login" => login(&session, &mut config, args.get(1)).await,
        "register" => register(&session, &mut config, &args[1..]).await,
        "logout" => logout(&session).await,
        "whoami" => whoami(&session, &client).await,
        "products" => products(&client, page_arg(args.get(1))?).await,
        "branches" => branches(&client).await,
        "orders" => orders(&session, &client, page_arg(args.get(1))?).await,
        "order" => place_order(&session, &client, &args[1..]).await,
        "help" | "--help" | "-h" => {
            println!("{}", USAGE);
            Ok(())
        }
        other => bail!("Unknown command '{}'\n\n{}", other, USAGE),
    };

    if let Err(ref e) = result {
        if e.downcast_ref::<ApiError>().is_some_and(ApiError::requires_login) {
            eprintln!("Your session has ended. Run `medcart login` to sign in again.");
        }
    }
    result
}

// ============================================================================
// Session commands
// ============================================================================

async fn login(session: &SessionManager, config: &mut Config, username: Option<&String>) -> Result<()> {
    let username = match username {
        Some(name) => name.clone(),
        None => match std::env::var(USERNAME_ENV) {
            Ok(name) if !name.trim().is_empty() => name,
            _ => prompt_username(config.last_username.as_deref())?,
        },
    };
    let password = read_password()?;

    let info = session
        .login(&username, &password)
        .await
        .map_err(describe_auth_error)?;

    remember_username(config, &username);

    let name = info
        .user
        .as_ref()
        .map(|u| u.display_name())
        .unwrap_or_else(|| username.clone());
    println!("Signed in as {}", name);
    Ok(())
}

async fn register(session: &SessionManager, config: &mut Config, args: &[String]) -> Result<()> {
    let (Some(username), Some(email)) = (args.first(), args.get(1)) else {
        bail!("Usage: medcart register <username> <email> [first] [last]");
    };
    let password = read_password()?;

    let mut form = Registration::new(username.as_str(), email.as_str(), password);
    if let Some(first) = args.get(2) {
        form.first_name = first.clone();
    }
    if let Some(last) = args.get(3) {
        form.last_name = last.clone();
    }

    session
        .register(&form)
        .await
        .map_err(describe_auth_error)?;

    remember_username(config, username);
    println!("Account created, signed in as {}", username);
    Ok(())
}

async fn logout(session: &SessionManager) -> Result<()> {
    if !session.resume().await {
        println!("Not signed in");
        return Ok(());
    }
    session.logout().await.map_err(describe_auth_error)?;
    println!("Signed out");
    Ok(())
}

async fn whoami(session: &SessionManager, client: &ApiClient) -> Result<()> {
    let profile = match ensure_signed_in(session).await? {
        Some(profile) => profile,
        None => client.fetch_profile().await?,
    };
    println!("{}", serde_json::to_string_pretty(&profile)?);
    Ok(())
}

/// Restore the stored session, failing when there is none to use.
/// Returns the profile fetched while validating, if the server answered.
async fn ensure_signed_in(session: &SessionManager) -> Result<Option<UserProfile>> {
    match session.restore().await {
        StartupCheck::Valid(profile) => Ok(Some(profile)),
        StartupCheck::Degraded(e) => {
            warn!(error = %e, "Could not validate session, continuing with stored tokens");
            Ok(None)
        }
        StartupCheck::NoSession => bail!("Not signed in. Run `medcart login` first."),
        StartupCheck::Invalid => bail!("Your session has ended. Run `medcart login` to sign in again."),
    }
}

// ============================================================================
// Storefront commands
// ============================================================================

async fn products(client: &ApiClient, page: u32) -> Result<()> {
    let page_data = client.fetch_products(page, DEFAULT_PAGE_SIZE).await?;

    for product in &page_data.results {
        let stock = if product.in_stock() { "" } else { "  (out of stock)" };
        println!(
            "{:<12} {:<40} {:>12.2}{}",
            product.product_id, product.name, product.price, stock
        );
    }
    println!("\n{} products, page {}{}", page_data.count, page, more_hint(page_data.has_next()));
    Ok(())
}

async fn branches(client: &ApiClient) -> Result<()> {
    for branch in client.fetch_branches().await? {
        println!("{:<12} {:<30} {}", branch.branch_id, branch.name, branch.address);
    }
    Ok(())
}

async fn orders(session: &SessionManager, client: &ApiClient, page: u32) -> Result<()> {
    ensure_signed_in(session).await?;
    let page_data = client.fetch_orders(page, DEFAULT_PAGE_SIZE).await?;

    if page_data.results.is_empty() {
        println!("No orders yet");
        return Ok(());
    }
    for order in &page_data.results {
        print_order(order);
    }
    println!("\n{} orders, page {}{}", page_data.count, page, more_hint(page_data.has_next()));
    Ok(())
}

async fn place_order(session: &SessionManager, client: &ApiClient, args: &[String]) -> Result<()> {
    let Some((branch, lines)) = args.split_first() else {
        bail!("Usage: medcart order <branch> <product:qty>...");
    };
    let mut order = NewOrder::new(branch.as_str());
    for line in lines {
        let (product, quantity) = parse_order_line(line)?;
        order = order.add_item(product, quantity);
    }

    ensure_signed_in(session).await?;
    let created = client.create_order(&order).await?;
    println!("Order placed:");
    print_order(&created);
    Ok(())
}

fn print_order(order: &Order) {
    println!(
        "{}  {}  {}  total {:.2}",
        order.order_id,
        order
            .created_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string()),
        order.status.as_deref().unwrap_or("unknown"),
        order.total()
    );
    for item in &order.items {
        println!("    {} x{} @ {:.2}", item.product, item.quantity, item.price);
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn parse_order_line(line: &str) -> Result<(&str, u32)> {
    let (product, quantity) = line.split_once(':').unwrap_or((line, "1"));
    let quantity: u32 = quantity
        .parse()
        .with_context(|| format!("Invalid quantity in '{}'", line))?;
    if product.is_empty() || quantity == 0 {
        bail!("Invalid order line '{}', expected <product:qty>", line);
    }
    Ok((product, quantity))
}

fn page_arg(arg: Option<&String>) -> Result<u32> {
    match arg {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("Invalid page number '{}'", raw)),
        None => Ok(1),
    }
}

fn more_hint(has_next: bool) -> &'static str {
    if has_next {
        " (more available)"
    } else {
        ""
    }
}

fn prompt_username(last: Option<&str>) -> Result<String> {
    match last {
        Some(last) => print!("Username [{}]: ", last),
        None => print!("Username: "),
    }
    io::stdout().flush()?;

    let mut username = String::new();
    io::stdin().read_line(&mut username)?;
    let username = username.trim();
    match (username.is_empty(), last) {
        (true, Some(last)) => Ok(last.to_string()),
        _ => Ok(username.to_string()),
    }
}

fn read_password() -> Result<String> {
    match std::env::var(PASSWORD_ENV) {
        Ok(password) if !password.is_empty() => Ok(password),
        _ => Ok(rpassword::prompt_password("Password: ")?),
    }
}

fn remember_username(config: &mut Config, username: &str) {
    config.last_username = Some(username.to_string());
    if let Err(e) = config.save() {
        warn!(error = %e, "Failed to save config");
    }
}

/// Turn an auth failure into a message fit for the terminal.
fn describe_auth_error(err: AuthError) -> anyhow::Error {
    match err {
        AuthError::ValidationError(fields) => {
            let details = fields
                .iter()
                .map(|(field, messages)| format!("  {}: {}", field, messages.join(" ")))
                .collect::<Vec<_>>()
                .join("\n");
            anyhow::anyhow!("Please fix the following:\n{}", details)
        }
        other => anyhow::Error::new(other),
    }
}
