use clap::Parser;
use emvkernel::error::TransportError;
use emvkernel::risk::OfflineLog;
use emvkernel::tlv::TlvStore;
use emvkernel::tvr::{TerminalVerificationResults, TransactionStatusInformation};
use emvkernel::{bcdutil, get_truncated_pan, tags, ApduInterface, CapkTable, Context, CryptogramType, Settings, Ttl};
use log::{error, info, warn, LevelFilter};
use log4rs::append::console::ConsoleAppender;
use log4rs::config::{Appender, Config, Root};
use pcsc::{Card, Protocols, Scope, ShareMode, MAX_BUFFER_SIZE};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Parser, Debug)]
#[command(name = "terminalsimulator", version, about = "EMV contact transaction simulation")]
struct Args {
    /// Kernel settings file, built-in defaults when omitted
    #[arg(long)]
    settings: Option<String>,

    /// CA public key file, the embedded key table (empty by default) when omitted
    #[arg(long)]
    capk: Option<String>,

    /// Amount authorised in the minor unit of the currency
    #[arg(long, default_value_t = 1)]
    amount: u64,

    /// Transaction type (9C) as two hex digits, e.g. 00 goods and services, 01 cash
    #[arg(long, default_value = "00")]
    transaction_type: String,

    /// Approved offline transactions counted towards the floor limit
    #[arg(long)]
    offline_log: Option<String>,

    /// log4rs configuration file, console logging when omitted
    #[arg(long)]
    log_config: Option<String>,

    /// Print all read or generated tags
    #[arg(long)]
    print_tags: bool,
}

struct PcscConnection {
    card: Card,
}

impl PcscConnection {
    fn connect() -> Result<PcscConnection, String> {
        let ctx = pcsc::Context::establish(Scope::User)
            .map_err(|err| format!("Failed to establish context: {}", err))?;

        let readers = ctx
            .list_readers_owned()
            .map_err(|err| format!("Failed to list readers: {}", err))?;
        let reader = readers
            .first()
            .ok_or_else(|| "No readers are connected.".to_string())?;

        let card = match ctx.connect(reader, ShareMode::Shared, Protocols::ANY) {
            Ok(card) => card,
            Err(pcsc::Error::NoSmartcard) => return Err("No card found in the reader".to_string()),
            Err(err) => return Err(format!("Could not connect to the card: {}", err)),
        };
        info!("Card reader: {:?}", reader);

        Ok(PcscConnection { card })
    }

    fn atr(&self) -> Result<Vec<u8>, String> {
        let status = self
            .card
            .status2_owned()
            .map_err(|err| format!("Could not read card status: {}", err))?;
        Ok(status.atr().to_vec())
    }
}

impl ApduInterface for PcscConnection {
    fn send_apdu(&self, apdu: &[u8]) -> Result<Vec<u8>, TransportError> {
        let mut apdu_response_buffer = [0; MAX_BUFFER_SIZE];
        self.card
            .transmit(apdu, &mut apdu_response_buffer)
            .map(|response| response.to_vec())
            .map_err(|err| TransportError::Interface(err.to_string()))
    }
}

#[derive(Serialize)]
struct TransactionReport {
    tvr: TerminalVerificationResults,
    tsi: TransactionStatusInformation,
    icc: BTreeMap<String, String>,
    terminal: BTreeMap<String, String>,
}

fn hex_tags(store: &TlvStore, censor_sensitive_fields: bool) -> BTreeMap<String, String> {
    store
        .iter()
        .map(|(tag, value)| {
            let value = hex::encode_upper(value);
            let value = if censor_sensitive_fields && tags::is_sensitive(tag) {
                censor_value(tag, &value)
            } else {
                value
            };
            (format!("{:02X}", tag), value)
        })
        .collect()
}

fn censor_value(tag: u32, value: &str) -> String {
    if tag == tags::PAN {
        get_truncated_pan(value.trim_end_matches('F'))
    } else {
        "*".repeat(value.len())
    }
}

fn init_logging(log_config: Option<&str>) -> Result<(), String> {
    match log_config {
        Some(file) => log4rs::init_file(file, Default::default()).map_err(|err| err.to_string()),
        None => {
            let stdout = ConsoleAppender::builder().build();
            let config = Config::builder()
                .appender(Appender::builder().build("stdout", Box::new(stdout)))
                .build(Root::builder().appender("stdout").build(LevelFilter::Info))
                .map_err(|err| err.to_string())?;
            log4rs::init_config(config).map_err(|err| err.to_string())?;
            Ok(())
        }
    }
}

fn run(args: Args) -> Result<(), String> {
    let settings = Settings::load(args.settings.as_deref()).map_err(|err| err.to_string())?;
    let capk = CapkTable::load(args.capk.as_deref()).map_err(|err| err.to_string())?;
    let offline_log = match &args.offline_log {
        Some(file) => Some(OfflineLog::load(file).map_err(|err| err.to_string())?),
        None => None,
    };

    let transaction_type = match hex::decode(&args.transaction_type) {
        Ok(value) if value.len() == 1 => value,
        _ => return Err(format!("Invalid transaction type {}", args.transaction_type)),
    };
    let amount = bcdutil::u64_to_bcd_n(args.amount, 6).map_err(|err| err.to_string())?;

    let connection = PcscConnection::connect()?;
    let atr = connection.atr()?;
    let mut ttl = Ttl::new(&connection, settings.censor_sensitive_fields);
    let mut context = Context::new(&mut ttl, &settings, &capk).map_err(|err| err.to_string())?;

    context.set_parameter(tags::AMOUNT_AUTHORISED, amount);
    context.set_parameter(tags::TRANSACTION_TYPE, transaction_type);

    let result = context.process(&atr, offline_log.as_ref());

    match &result {
        Ok(CryptogramType::TransactionCertificate) => info!("Transaction approved offline"),
        Ok(CryptogramType::AuthorisationRequestCryptogram) => info!("Online authorisation requested"),
        Ok(CryptogramType::ApplicationAuthenticationCryptogram) => warn!("Transaction declined"),
        Err(err) => warn!("Transaction terminated: {}", err),
    }

    if args.print_tags {
        let report = TransactionReport {
            tvr: context.tvr,
            tsi: context.tsi,
            icc: hex_tags(&context.icc, settings.censor_sensitive_fields),
            terminal: hex_tags(&context.terminal, settings.censor_sensitive_fields),
        };
        println!("{}", serde_yaml::to_string(&report).map_err(|err| err.to_string())?);
    }

    context.clear();
    result.map(|_| ()).map_err(|err| err.to_string())
}

fn main() {
    let args = Args::parse();

    if let Err(err) = init_logging(args.log_config.as_deref()) {
        eprintln!("Could not initialise logging: {}", err);
        std::process::exit(1);
    }

    std::process::exit(match run(args) {
        Ok(()) => 0,
        Err(err) => {
            error!("{}", err);
            1
        }
    });
}
