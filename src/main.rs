// Airlink command line
// Runs either side of a connection, or builds and decodes the reduced
// payloads used for QR codes

use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use airlink::config::{self, AirgapConfig, Config};
use airlink::connection::ConnectionHandle;
use airlink::network::{self, HandshakeConfig, Role, Str0mPeer};
use airlink::rpc::{
    self, handler, method_not_found, InboundSink, RequestHandler, RpcEngine, RpcId, RpcRequest,
    Transport,
};

#[derive(Debug, PartialEq)]
enum Command {
    Initiate,
    Respond { sid: String },
    QrCall { method: String, id: String, params: Value },
    Decode { payload: String },
}

#[derive(Debug, Default, PartialEq)]
struct Options {
    debug: bool,
    force_fallback: bool,
    signaling: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let (options, command) = match parse_args(&args) {
        Ok(Some(parsed)) => parsed,
        Ok(None) => {
            print_usage(&args[0]);
            return Ok(());
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            print_usage(&args[0]);
            std::process::exit(1);
        }
    };

    airlink::debug::init(options.debug)?;

    let mut config = config::load_config().unwrap_or_else(|e| {
        warn!("Failed to load config: {}, using defaults", e);
        Config::default()
    });
    if options.force_fallback {
        config.network.force_fallback = true;
    }
    if let Some(url) = options.signaling {
        config.network.signaling_server = url;
    }

    match command {
        Command::Initiate => initiate(&config).await,
        Command::Respond { sid } => respond(&config, sid).await,
        Command::QrCall { method, id, params } => qr_call(&method, &id, params).await,
        Command::Decode { payload } => decode(&payload),
    }
}

/// Parse command line arguments. `Ok(None)` means help was requested.
fn parse_args(args: &[String]) -> Result<Option<(Options, Command)>> {
    let mut options = Options::default();
    let mut command = None;
    let mut rest = args.iter().skip(1);

    while let Some(arg) = rest.next() {
        let next = match arg.as_str() {
            "--debug" => {
                options.debug = true;
                None
            }
            "--force-fallback" => {
                options.force_fallback = true;
                None
            }
            "--signaling" => {
                options.signaling = Some(take_value(arg, &mut rest)?);
                None
            }
            "--initiate" | "-i" => Some(Command::Initiate),
            "--respond" | "-r" => Some(Command::Respond {
                sid: take_value(arg, &mut rest)?,
            }),
            "--qr-call" => {
                let method = take_value(arg, &mut rest)?;
                let id = take_value(arg, &mut rest)?;
                let raw = take_value(arg, &mut rest)?;
                let params = serde_json::from_str(&raw)
                    .with_context(|| format!("params are not valid JSON: {}", raw))?;
                Some(Command::QrCall { method, id, params })
            }
            "--decode" => Some(Command::Decode {
                payload: take_value(arg, &mut rest)?,
            }),
            "--help" | "-h" => return Ok(None),
            other => return Err(anyhow!("Unknown argument: {}", other)),
        };

        if let Some(next) = next {
            if command.replace(next).is_some() {
                return Err(anyhow!("only one command may be given"));
            }
        }
    }

    command
        .map(|command| Some((options, command)))
        .ok_or_else(|| anyhow!("no command given"))
}

fn take_value<'a>(flag: &str, rest: &mut impl Iterator<Item = &'a String>) -> Result<String> {
    rest.next()
        .cloned()
        .ok_or_else(|| anyhow!("{} requires a value", flag))
}

fn print_usage(program: &str) {
    println!("Airlink - JSON-RPC between a browser and an airgapped device");
    println!();
    println!("Usage:");
    println!("  {} --initiate                       # Open a session and query wallets", program);
    println!("  {} --respond <sid>                  # Serve wallets for a session", program);
    println!("  {} --qr-call <method> <id> <params> # Print a reduced call payload", program);
    println!("  {} --decode <payload>               # Decode a scanned payload", program);
    println!();
    println!("Options:");
    println!("  --debug              Log to {}", airlink::debug::LOG_FILE_PATH);
    println!("  --force-fallback     Relay through the signaling server right away");
    println!("  --signaling <url>    Signaling server WebSocket URL");
    println!();
    println!("Config file: {}", config::get_config_path().display());
}

async fn connect(
    config: &Config,
    role: Role,
    handler: RequestHandler,
    on_sid: impl FnOnce(&str) + Send,
) -> Result<Arc<airlink::connection::Connection>> {
    let handle = ConnectionHandle::new(role == Role::Initiator);
    let peer = Str0mPeer::open(config.network.stun_server()).await?;
    let handshake = HandshakeConfig::from_network(&config.network);
    let timeout = Duration::from_secs(config.network.connection_timeout_secs);

    tokio::time::timeout(
        timeout,
        network::establish(&handle, role, peer, handshake, handler, on_sid),
    )
    .await
    .map_err(|_| anyhow!("no connection after {:?}", timeout))?
}

async fn initiate(config: &Config) -> Result<()> {
    let connection = connect(config, Role::Initiator, method_not_found(), |sid| {
        println!("Session id: {}", sid);
        match arboard::Clipboard::new().and_then(|mut clipboard| clipboard.set_text(sid.to_string())) {
            Ok(()) => println!("(copied to clipboard)"),
            Err(e) => warn!("Could not copy session id to clipboard: {}", e),
        }
        println!("Waiting for the airgapped side to join...");
    })
    .await?;

    println!(
        "Connected ({})",
        if connection.using_fallback() { "relayed through signaling server" } else { "direct" }
    );

    let rpc = connection
        .rpc()
        .ok_or_else(|| anyhow!("connection has no engine"))?;
    let wallets = rpc.call("getWalletList", vec![json!([])]).await?;
    println!("Wallets: {}", serde_json::to_string_pretty(&wallets)?);

    rpc.ping().await?;
    println!("Ping OK");
    Ok(())
}

async fn respond(config: &Config, sid: String) -> Result<()> {
    let connection = connect(
        config,
        Role::Responder { sid },
        wallet_handler(config.airgap.clone()),
        |_| {},
    )
    .await?;

    println!(
        "Connected ({}), serving requests. Press Ctrl-C to stop.",
        if connection.using_fallback() { "relayed through signaling server" } else { "direct" }
    );
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    Ok(())
}

/// Serves `ping` and `getWalletList [blockchains]`
fn wallet_handler(airgap: AirgapConfig) -> RequestHandler {
    let airgap = Arc::new(airgap);
    handler(move |request: RpcRequest| {
        let airgap = airgap.clone();
        async move {
            info!("📥 {} request", request.method);
            match request.method.as_str() {
                "ping" => Ok(json!("pong")),
                "getWalletList" => {
                    let filter = blockchain_filter(&request.params);
                    serde_json::to_value(airgap.wallets_for(&filter)).map_err(|e| {
                        json!({ "code": -32603, "message": e.to_string() })
                    })
                }
                other => Err(rpc::method_not_found_error(other)),
            }
        }
    })
}

/// `{"blockchains": [..]}` or `[[..]]`; anything else means no filter
fn blockchain_filter(params: &Value) -> Vec<String> {
    let chains = match params {
        Value::Object(map) => map.get("blockchains"),
        Value::Array(items) => items.first(),
        _ => None,
    };
    chains
        .and_then(|chains| serde_json::from_value(chains.clone()).ok())
        .unwrap_or_default()
}

/// Prints whatever the engine sends; answers are typed in by hand
struct ScreenTransport;

impl Transport for ScreenTransport {
    fn send(&self, wire: String) {
        println!("{}", wire);
    }

    fn on_receive(&self, _sink: InboundSink) {}

    fn ready(&self) -> bool {
        true
    }
}

async fn qr_call(method: &str, id: &str, params: Value) -> Result<()> {
    let engine = RpcEngine::new(Arc::new(ScreenTransport), method_not_found());
    let (wire, pending) = engine.start_call(method, params, true, Some(RpcId::parse(id)))?;
    println!("{}", wire);
    println!("Scan the answer and paste it here:");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let answer = pending.wait();
    tokio::pin!(answer);
    loop {
        tokio::select! {
            result = &mut answer => {
                match result {
                    Ok(result) => println!("Result: {}", result),
                    Err(e) => println!("Error: {}", e),
                }
                return Ok(());
            }
            line = lines.next_line() => match line? {
                Some(line) => engine.on_message(line.trim()),
                None => return Err(anyhow!("input ended before an answer arrived")),
            },
        }
    }
}

fn decode(payload: &str) -> Result<()> {
    match rpc::decode(payload)? {
        Some(envelope) => println!("{:#?}", envelope),
        None => println!("(empty payload)"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("airlink")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_commands_and_flags() {
        let (options, command) = parse_args(&args(&["--debug", "--respond", "ABCDEF"]))
            .unwrap()
            .unwrap();
        assert!(options.debug);
        assert_eq!(command, Command::Respond { sid: "ABCDEF".into() });

        let (options, command) =
            parse_args(&args(&["--initiate", "--force-fallback", "--signaling", "ws://hub"]))
                .unwrap()
                .unwrap();
        assert!(options.force_fallback);
        assert_eq!(options.signaling.as_deref(), Some("ws://hub"));
        assert_eq!(command, Command::Initiate);

        let (_, command) = parse_args(&args(&["--qr-call", "sign", "7", "[\"0xabc\"]"]))
            .unwrap()
            .unwrap();
        assert_eq!(
            command,
            Command::QrCall {
                method: "sign".into(),
                id: "7".into(),
                params: json!(["0xabc"]),
            }
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_args(&args(&[])).is_err());
        assert!(parse_args(&args(&["--respond"])).is_err());
        assert!(parse_args(&args(&["--initiate", "--respond", "X"])).is_err());
        assert!(parse_args(&args(&["--qr-call", "m", "1", "{bad"])).is_err());
        assert!(parse_args(&args(&["--bogus"])).is_err());
        assert!(parse_args(&args(&["--help"])).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_wallet_handler_filters() {
        let airgap: AirgapConfig = toml::from_str(
            r#"
            [[wallets]]
            blockchain = "eth"
            address = "0xabc"
            [[wallets]]
            blockchain = "btc"
            address = "bc1q"
            "#,
        )
        .unwrap();
        let serve = wallet_handler(airgap);

        let request = |method: &str, params: Value| RpcRequest {
            method: method.into(),
            id: Some(RpcId::from(1u64)),
            params,
        };
        let all = serve(request("getWalletList", json!([]))).await.unwrap();
        assert_eq!(all.as_array().unwrap().len(), 2);
        let btc = serve(request("getWalletList", json!([["btc"]]))).await.unwrap();
        assert_eq!(btc, json!([{"blockchain": "btc", "address": "bc1q"}]));
        let eth = serve(request("getWalletList", json!({"blockchains": ["eth"]})))
            .await
            .unwrap();
        assert_eq!(eth, json!([{"blockchain": "eth", "address": "0xabc"}]));
        let unfiltered = serve(request("getWalletList", json!({}))).await.unwrap();
        assert_eq!(unfiltered.as_array().unwrap().len(), 2);
        assert_eq!(serve(request("ping", json!([]))).await.unwrap(), json!("pong"));
        assert!(serve(request("sign", json!([]))).await.is_err());
    }
}
