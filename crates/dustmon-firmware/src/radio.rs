//! Radio task bridging esp-radio to the core radio state machines.
//!
//! The controller issues commands through [`StationHandle`] and
//! [`PeerHandle`], which only queue them. [`RadioWorker`] runs them one at a
//! time against the Wi-Fi controller, ESP-NOW and the network stack, and
//! reports every completion through [`RadioEvents`]. Commands keep their
//! order, so stopping station mode always finishes before ESP-NOW starts.

use dustmon_core::clock::WallClock;
use dustmon_core::clock::sntp::{self, NTP_PORT, PACKET_LEN, SntpError};
use dustmon_core::connectivity::{LinkError, StationDriver};
use dustmon_core::events::{PeerEvent, RadioEvents, StationEvent};
use dustmon_core::transport::{Datagram, MAX_DATAGRAM_LEN, PeerAddress, PeerLink};
use embassy_futures::select::{Either, select};
use embassy_net::dns::DnsQueryType;
use embassy_net::udp::{PacketMetadata, UdpSocket};
use embassy_net::{Runner, Stack};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::{Duration, with_timeout};
use esp_radio::esp_now::{EspNow, EspNowWifiInterface, PeerInfo, ReceivedData};
use esp_radio::wifi::{ClientConfig, ModeConfig, WifiController, WifiDevice};
use heapless::String;
use log::{debug, info, warn};
use thiserror_no_std::Error;

use crate::clock::SystemClock;

const COMMAND_CAPACITY: usize = 8;
const DHCP_TIMEOUT: Duration = Duration::from_secs(15);
const NTP_TIMEOUT: Duration = Duration::from_secs(5);
const UDP_BUFFER_LEN: usize = 128;

pub enum RadioCommand {
    StationStart {
        ssid: String<32>,
        password: String<64>,
    },
    Connect,
    Disconnect,
    StationStop,
    RequestTime {
        server: String<64>,
    },
    PeerStart,
    PeerStop,
    AddPeer(PeerAddress),
    Send {
        to: PeerAddress,
        payload: heapless::Vec<u8, MAX_DATAGRAM_LEN>,
    },
}

static COMMANDS: Channel<CriticalSectionRawMutex, RadioCommand, COMMAND_CAPACITY> =
    Channel::new();

fn submit(command: RadioCommand) -> Result<(), LinkError> {
    COMMANDS.try_send(command).map_err(|_| LinkError::Busy)
}

/// Station-mode commands for the controller.
#[derive(Debug, Default)]
pub struct StationHandle {
    initialized: bool,
}

impl StationHandle {
    fn check(&self) -> Result<(), LinkError> {
        if self.initialized {
            Ok(())
        } else {
            Err(LinkError::NotInitialized)
        }
    }
}

impl StationDriver for StationHandle {
    fn init(&mut self) -> Result<(), LinkError> {
        self.initialized = true;
        Ok(())
    }

    fn deinit(&mut self) {
        self.initialized = false;
    }

    fn start(&mut self, ssid: &str, password: &str) -> Result<(), LinkError> {
        self.check()?;
        submit(RadioCommand::StationStart {
            ssid: String::try_from(ssid).map_err(|_| LinkError::Rejected("ssid too long"))?,
            password: String::try_from(password)
                .map_err(|_| LinkError::Rejected("password too long"))?,
        })
    }

    fn connect(&mut self) -> Result<(), LinkError> {
        self.check()?;
        submit(RadioCommand::Connect)
    }

    fn disconnect(&mut self) -> Result<(), LinkError> {
        self.check()?;
        submit(RadioCommand::Disconnect)
    }

    fn stop(&mut self) -> Result<(), LinkError> {
        self.check()?;
        submit(RadioCommand::StationStop)
    }

    fn request_time(&mut self, server: &str) -> Result<(), LinkError> {
        self.check()?;
        submit(RadioCommand::RequestTime {
            server: String::try_from(server)
                .map_err(|_| LinkError::Rejected("server name too long"))?,
        })
    }
}

/// ESP-NOW commands for the controller.
#[derive(Debug, Default)]
pub struct PeerHandle;

impl PeerLink for PeerHandle {
    fn start(&mut self) -> Result<(), LinkError> {
        submit(RadioCommand::PeerStart)
    }

    fn stop(&mut self) {
        if submit(RadioCommand::PeerStop).is_err() {
            warn!(" Peer stop dropped, command queue full");
        }
    }

    fn add_peer(&mut self, address: PeerAddress) -> Result<(), LinkError> {
        submit(RadioCommand::AddPeer(address))
    }

    fn send(&mut self, to: PeerAddress, payload: &[u8]) -> Result<(), LinkError> {
        let payload = heapless::Vec::from_slice(payload)
            .map_err(|_| LinkError::Rejected("datagram too long"))?;
        submit(RadioCommand::Send { to, payload })
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
enum TimeQueryError {
    #[error("name lookup failed")]
    Dns,
    #[error("socket error")]
    Socket,
    #[error("no reply")]
    Timeout,
    #[error("{0}")]
    Reply(#[from] SntpError),
}

/// Owner of the radio hardware.
pub struct RadioWorker {
    wifi: WifiController<'static>,
    esp_now: EspNow<'static>,
    stack: Stack<'static>,
    events: &'static RadioEvents,
    clock: SystemClock,
    peer_active: bool,
}

impl RadioWorker {
    pub fn new(
        wifi: WifiController<'static>,
        esp_now: EspNow<'static>,
        stack: Stack<'static>,
        events: &'static RadioEvents,
        clock: SystemClock,
    ) -> Self {
        Self {
            wifi,
            esp_now,
            stack,
            events,
            clock,
            peer_active: false,
        }
    }

    pub async fn run(mut self) -> ! {
        loop {
            if self.peer_active {
                let next = select(COMMANDS.receive(), self.esp_now.receive_async()).await;
                match next {
                    Either::First(command) => self.execute(command).await,
                    Either::Second(received) => self.deliver(received),
                }
            } else {
                let command = COMMANDS.receive().await;
                self.execute(command).await;
            }
        }
    }

    async fn execute(&mut self, command: RadioCommand) {
        match command {
            RadioCommand::StationStart { ssid, password } => {
                let config = ModeConfig::Client(
                    ClientConfig::default()
                        .with_ssid(ssid.as_str().into())
                        .with_password(password.as_str().into()),
                );
                let started = match self.wifi.set_config(&config) {
                    Ok(()) => self.wifi.start_async().await,
                    Err(e) => Err(e),
                };
                match started {
                    Ok(()) => self.events.post_station(StationEvent::Started),
                    Err(e) => {
                        warn!(" Station start failed: {:?}", e);
                        self.events.post_station(StationEvent::Stopped)
                    }
                };
            }
            RadioCommand::Connect => match self.wifi.connect_async().await {
                Ok(()) => {
                    self.events.post_station(StationEvent::Connected);
                    match with_timeout(DHCP_TIMEOUT, self.stack.wait_config_up()).await {
                        Ok(()) => {
                            if let Some(config) = self.stack.config_v4() {
                                info!(" Got IP {}", config.address);
                            }
                            self.events.post_station(StationEvent::GotIp);
                        }
                        Err(_) => {
                            warn!(" No DHCP lease");
                            self.events.post_station(StationEvent::Disconnected);
                        }
                    }
                }
                Err(e) => {
                    debug!(" Connect failed: {:?}", e);
                    self.events.post_station(StationEvent::Disconnected);
                }
            },
            RadioCommand::Disconnect => {
                if let Err(e) = self.wifi.disconnect_async().await {
                    debug!(" Disconnect: {:?}", e);
                }
                self.events.post_station(StationEvent::Disconnected);
            }
            RadioCommand::StationStop => {
                if let Err(e) = self.wifi.stop_async().await {
                    debug!(" Stop: {:?}", e);
                }
                self.events.post_station(StationEvent::Stopped);
            }
            RadioCommand::RequestTime { server } => match self.query_time(&server).await {
                Ok(unix_micros) => {
                    self.events
                        .post_station(StationEvent::TimeReceived { unix_micros });
                }
                Err(e) => {
                    warn!(" Time query to {} failed: {}", server, e);
                    self.events.post_station(StationEvent::TimeFailed);
                }
            },
            RadioCommand::PeerStart => {
                if !matches!(self.wifi.is_started(), Ok(true)) {
                    let config = ModeConfig::Client(ClientConfig::default());
                    let started = match self.wifi.set_config(&config) {
                        Ok(()) => self.wifi.start_async().await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = started {
                        warn!(" Radio start for ESP-NOW failed: {:?}", e);
                        return;
                    }
                }
                self.peer_active = true;
                debug!(" ESP-NOW listening");
            }
            RadioCommand::PeerStop => {
                self.peer_active = false;
                if let Err(e) = self.wifi.stop_async().await {
                    debug!(" Stop: {:?}", e);
                }
            }
            RadioCommand::AddPeer(address) => {
                let peer_address = address.octets();
                if self.esp_now.peer_exists(&peer_address) {
                    return;
                }
                let peer = PeerInfo {
                    interface: EspNowWifiInterface::Sta,
                    peer_address,
                    lmk: None,
                    channel: None,
                    encrypt: false,
                };
                if let Err(e) = self.esp_now.add_peer(peer) {
                    warn!(" Adding peer {} failed: {:?}", address, e);
                }
            }
            RadioCommand::Send { to, payload } => {
                let delivered = match self.esp_now.send_async(&to.octets(), &payload).await {
                    Ok(()) => true,
                    Err(e) => {
                        debug!(" Send to {} failed: {:?}", to, e);
                        false
                    }
                };
                self.events
                    .post_peer(PeerEvent::SendStatus { to, delivered });
            }
        }
    }

    fn deliver(&self, received: ReceivedData) {
        let received_at_micros = self.clock.now_micros();
        let Ok(payload) = heapless::Vec::from_slice(received.data()) else {
            debug!(" Oversized datagram dropped");
            return;
        };
        self.events.post_peer(PeerEvent::Received(Datagram {
            from: PeerAddress::new(received.info.src_address),
            received_at_micros,
            payload,
        }));
    }

    async fn query_time(&self, server: &str) -> Result<i64, TimeQueryError> {
        let addresses = self
            .stack
            .dns_query(server, DnsQueryType::A)
            .await
            .map_err(|_| TimeQueryError::Dns)?;
        let address = *addresses.first().ok_or(TimeQueryError::Dns)?;

        let mut rx_meta = [PacketMetadata::EMPTY; 1];
        let mut rx_buffer = [0u8; UDP_BUFFER_LEN];
        let mut tx_meta = [PacketMetadata::EMPTY; 1];
        let mut tx_buffer = [0u8; UDP_BUFFER_LEN];
        let mut socket = UdpSocket::new(
            self.stack,
            &mut rx_meta,
            &mut rx_buffer,
            &mut tx_meta,
            &mut tx_buffer,
        );
        socket.bind(0).map_err(|_| TimeQueryError::Socket)?;
        socket
            .send_to(&sntp::request(), (address, NTP_PORT))
            .await
            .map_err(|_| TimeQueryError::Socket)?;

        let mut reply = [0u8; PACKET_LEN];
        let (len, _) = with_timeout(NTP_TIMEOUT, socket.recv_from(&mut reply))
            .await
            .map_err(|_| TimeQueryError::Timeout)?
            .map_err(|_| TimeQueryError::Socket)?;
        Ok(sntp::parse_reply(&reply[..len])?)
    }
}

#[embassy_executor::task]
pub async fn radio_task(worker: RadioWorker) -> ! {
    worker.run().await
}

#[embassy_executor::task]
pub async fn net_task(mut runner: Runner<'static, WifiDevice<'static>>) -> ! {
    runner.run().await
}
