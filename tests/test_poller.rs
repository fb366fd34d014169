mod common;
use common::*;
use sma_bridge::config::{Config, ConfigWrapper};
use sma_bridge::datalog_writer::DatalogWriter;
use sma_bridge::poller::Poller;
use sma_bridge::sma::packet::{Reply, CMD_LOGOFF, CMD_LOGON, CMD_TIME};
use sma_bridge::utils::Utils;

use {anyhow::Result, tokio::sync::broadcast};

const STATUS_OBJECT: u16 = 0x5180;

fn inverter(shutdown: broadcast::Sender<()>) -> impl FnMut(&Reply) -> Vec<Answer> + Send + 'static {
    move |request: &Reply| {
        if request.header.control != 0xA0 {
            return Vec::new();
        }
        let reply = ReplyBuilder::new(request);

        match request.command() {
            Ok(CMD_LOGON) => vec![reply.body(&request.body).answer()],
            Ok(CMD_TIME) => {
                let mut body = vec![0u8; 56];
                body[0..4].copy_from_slice(&CMD_TIME.to_le_bytes());
                body[40..44].copy_from_slice(&Utils::unix_now().to_le_bytes());
                body[44..48].copy_from_slice(&Utils::unix_now().to_le_bytes());
                vec![reply.body(&body).answer()]
            }
            Ok(command) => {
                let object = (command >> 16) as u16;
                let records = match object {
                    0x5100 => Factory::spot_record(0x263F, 0x40, 2300),
                    0x5380 => Factory::spot_record(0x251E, 0x40, 2400),
                    STATUS_OBJECT => {
                        // stop after this cycle
                        let _ = shutdown.send(());
                        Vec::new()
                    }
                    _ => Vec::new(),
                };
                vec![reply.body(&Factory::records_body(object, &records)).answer()]
            }
            Err(_) => Vec::new(),
        }
    }
}

fn lines(path: &std::path::Path) -> Result<Vec<serde_json::Value>> {
    std::fs::read_to_string(path)?
        .lines()
        .map(|l| serde_json::from_str(l).map_err(Into::into))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn polls_and_records_until_shutdown() -> Result<()> {
    common_setup();
    let config = ConfigWrapper::from_config(Config::from_yaml(
        "
inverters:
  - address: /dev/rfcomm0
    password: '0000'
",
    )?);
    let datalog_file = tempfile::NamedTempFile::new()?;
    let datalog = DatalogWriter::new(&datalog_file.path().to_string_lossy())?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let mock = MockTransport::with_devices(&[inverter_mac()]);
    mock.set_signal(0xFF);
    mock.respond_with(inverter(shutdown_tx));

    let mut poller = Poller::new(
        config.clone(),
        config.enabled_inverters()[0].clone(),
        Some(datalog.clone()),
        shutdown_rx,
    );
    poller.run(mock.clone()).await?;

    let json = lines(datalog_file.path())?;
    let kinds: Vec<&str> = json.iter().filter_map(|j| j["kind"].as_str()).collect();
    assert_eq!(kinds, vec!["info", "ac", "dc", "statistics", "status"]);
    assert!(json.iter().all(|j| j["serial"] == SERIAL));
    assert_eq!(json[1]["data"]["total_power"], 2300);
    assert_eq!(json[2]["data"]["trackers"][0]["power"], 2400);
    assert!(json[3]["data"]["total_yield"].is_null());
    assert_eq!(datalog.lines_written(), 5);

    let last = mock.requests().pop().unwrap();
    assert_eq!(last.command()?, CMD_LOGOFF);
    Ok(())
}
