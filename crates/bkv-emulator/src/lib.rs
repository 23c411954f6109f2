//! Programmable gateway-device emulator.
//!
//! Speaks the BKV wire protocol over a real TCP connection so gateway
//! integration tests can drive full charge lifecycles: register, heartbeat,
//! acknowledge control downlinks, report port status, settle. Behaviour is
//! scripted through [`EmulatorConfig`] (automatic responses) and
//! [`EmulatorHandle`] (explicit commands and captured downlink frames).

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bkv_protocol::frame::{Decoded, Frame, GatewayId};
use bkv_protocol::payload::{
    ControlAck, ControlBlock, PortReading, Register, SettleReason, Settlement,
    encode_generic_ack, encode_status_report,
};
use bkv_protocol::{BkvCodec, command, port_status};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct EmulatorConfig {
    /// 14-nibble packed-hex gateway identity.
    pub phy_id: String,
    pub socket_count: u8,
    pub firmware: String,
    pub heartbeat_interval: Duration,
    /// Acknowledge control downlinks automatically.
    pub auto_ack: bool,
    /// Result byte for automatic acks; non-zero simulates a refusing device.
    pub ack_result: u8,
    /// Follow an applied control with a fresh status report.
    pub auto_status_on_control: bool,
    /// Wattage reported while a socket charges.
    pub charging_power_w: u16,
}

impl Default for EmulatorConfig {
    fn default() -> EmulatorConfig {
        EmulatorConfig {
            phy_id: "82241218000382".to_owned(),
            socket_count: 4,
            firmware: "emu-1.0.0".to_owned(),
            heartbeat_interval: Duration::from_secs(10),
            auto_ack: true,
            ack_result: 0,
            auto_status_on_control: true,
            charging_power_w: 1200,
        }
    }
}

#[derive(Debug)]
pub enum EmulatorCommand {
    SendHeartbeat,
    SendStatus,
    SetPort {
        socket_no: u8,
        status_bits: u8,
        power_w: u16,
    },
    Settle {
        socket_no: u8,
        reason: SettleReason,
        kwh_0p01: u32,
        duration_min: u16,
    },
    Disconnect,
}

/// Control surface for one connected emulated device.
pub struct EmulatorHandle {
    pub phy_id: String,
    ctl: mpsc::Sender<EmulatorCommand>,
    received: Arc<Mutex<Vec<Frame>>>,
    task: JoinHandle<()>,
}

impl EmulatorHandle {
    pub async fn send(&self, cmd: EmulatorCommand) -> bool {
        self.ctl.send(cmd).await.is_ok()
    }

    pub async fn send_heartbeat(&self) -> bool {
        self.send(EmulatorCommand::SendHeartbeat).await
    }

    pub async fn send_status(&self) -> bool {
        self.send(EmulatorCommand::SendStatus).await
    }

    pub async fn set_port(&self, socket_no: u8, status_bits: u8, power_w: u16) -> bool {
        self.send(EmulatorCommand::SetPort {
            socket_no,
            status_bits,
            power_w,
        })
        .await
    }

    pub async fn settle(
        &self,
        socket_no: u8,
        reason: SettleReason,
        kwh_0p01: u32,
        duration_min: u16,
    ) -> bool {
        self.send(EmulatorCommand::Settle {
            socket_no,
            reason,
            kwh_0p01,
            duration_min,
        })
        .await
    }

    /// Drop the connection without ceremony (simulates a network cut).
    pub async fn disconnect(self) {
        let _ = self.ctl.send(EmulatorCommand::Disconnect).await;
        let _ = self.task.await;
    }

    /// Every downlink frame received so far.
    pub async fn received(&self) -> Vec<Frame> {
        self.received.lock().await.clone()
    }

    /// Poll until a downlink with the given command arrives.
    pub async fn wait_for_command(&self, cmd: u16, timeout: Duration) -> Option<Frame> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(frame) = self
                .received
                .lock()
                .await
                .iter()
                .find(|f| f.command == cmd)
                .cloned()
            {
                return Some(frame);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

struct PortSlot {
    status_bits: u8,
    power_w: u16,
    /// Business number of the charge the platform last switched on here.
    business_no: u16,
}

struct Device {
    cfg: EmulatorConfig,
    gateway_id: GatewayId,
    framed: Framed<TcpStream, BkvCodec>,
    ports: Vec<PortSlot>,
    next_msg_id: u32,
}

/// Connect to the gateway and run the device in a background task.
pub async fn connect(addr: SocketAddr, cfg: EmulatorConfig) -> io::Result<EmulatorHandle> {
    let gateway_id = GatewayId::parse(&cfg.phy_id)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    let framed = Framed::new(stream, BkvCodec::default());

    let ports = (0..cfg.socket_count)
        .map(|_| PortSlot {
            status_bits: port_status::BIT_ONLINE | port_status::BIT_IDLE,
            power_w: 0,
            business_no: 0,
        })
        .collect();

    let mut device = Device {
        cfg,
        gateway_id,
        framed,
        ports,
        next_msg_id: 1,
    };
    device.send_register().await?;
    device.send_heartbeat().await?;
    device.send_status().await?;

    let phy_id = device.cfg.phy_id.clone();
    let received = Arc::new(Mutex::new(Vec::new()));
    let (ctl_tx, ctl_rx) = mpsc::channel(32);
    let task = tokio::spawn(device.run(ctl_rx, received.clone()));

    Ok(EmulatorHandle {
        phy_id,
        ctl: ctl_tx,
        received,
        task,
    })
}

impl Device {
    async fn run(
        mut self,
        mut ctl: mpsc::Receiver<EmulatorCommand>,
        received: Arc<Mutex<Vec<Frame>>>,
    ) {
        // Real devices drift; a jittered period keeps emulated fleets from
        // heartbeating in lockstep.
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..500));
        let mut heartbeat = tokio::time::interval(self.cfg.heartbeat_interval + jitter);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if self.send_heartbeat().await.is_err() {
                        return;
                    }
                }
                cmd = ctl.recv() => match cmd {
                    None | Some(EmulatorCommand::Disconnect) => {
                        debug!("emulator disconnecting");
                        return;
                    }
                    Some(cmd) => {
                        if self.apply_command(cmd).await.is_err() {
                            return;
                        }
                    }
                },
                frame = self.framed.next() => match frame {
                    None => return,
                    Some(Err(e)) => {
                        warn!(error = %e, "emulator read error");
                        return;
                    }
                    Some(Ok(Decoded::Bad(bad))) => {
                        warn!(kind = bad.kind.label(), "emulator saw a bad frame");
                    }
                    Some(Ok(Decoded::Frame(frame))) => {
                        received.lock().await.push(frame.clone());
                        if self.handle_downlink(frame).await.is_err() {
                            return;
                        }
                    }
                },
            }
        }
    }

    async fn apply_command(&mut self, cmd: EmulatorCommand) -> io::Result<()> {
        match cmd {
            EmulatorCommand::SendHeartbeat => self.send_heartbeat().await,
            EmulatorCommand::SendStatus => self.send_status().await,
            EmulatorCommand::SetPort {
                socket_no,
                status_bits,
                power_w,
            } => {
                if let Some(slot) = self.ports.get_mut(socket_no as usize) {
                    slot.status_bits = status_bits;
                    slot.power_w = power_w;
                }
                self.send_status().await
            }
            EmulatorCommand::Settle {
                socket_no,
                reason,
                kwh_0p01,
                duration_min,
            } => {
                let business_no = self
                    .ports
                    .get(socket_no as usize)
                    .map(|slot| slot.business_no)
                    .unwrap_or(0);
                if let Some(slot) = self.ports.get_mut(socket_no as usize) {
                    slot.status_bits = port_status::BIT_ONLINE | port_status::BIT_IDLE;
                    slot.power_w = 0;
                    slot.business_no = 0;
                }
                let settlement = Settlement {
                    business_no,
                    socket_no,
                    reason,
                    kwh_0p01,
                    duration_min,
                    order_no: None,
                };
                let msg_id = self.alloc_msg_id();
                self.send_uplink(command::SETTLEMENT, msg_id, settlement.encode())
                    .await?;
                self.send_status().await
            }
            EmulatorCommand::Disconnect => Ok(()),
        }
    }

    async fn handle_downlink(&mut self, frame: Frame) -> io::Result<()> {
        match frame.command {
            command::CONTROL => {
                let block = match ControlBlock::decode(&frame.payload) {
                    Ok(block) => block,
                    Err(e) => {
                        warn!(error = %e, "emulator got an unparseable control block");
                        return Ok(());
                    }
                };
                if let Some(slot) = self.ports.get_mut(block.socket_no as usize) {
                    if block.switch_on {
                        slot.status_bits = port_status::BIT_ONLINE | port_status::BIT_CHARGING;
                        slot.power_w = self.cfg.charging_power_w;
                        slot.business_no = (frame.msg_id & 0xFFFF) as u16;
                    } else {
                        slot.status_bits = port_status::BIT_ONLINE | port_status::BIT_IDLE;
                        slot.power_w = 0;
                    }
                }
                if self.cfg.auto_ack {
                    let ack = ControlAck {
                        socket_no: block.socket_no,
                        result: self.cfg.ack_result,
                    };
                    self.send_uplink(command::CONTROL, frame.msg_id, ack.encode())
                        .await?;
                }
                if self.cfg.auto_status_on_control {
                    self.send_status().await?;
                }
                Ok(())
            }
            command::QUERY_SOCKET => self.send_status().await,
            command::PARAM_SET | command::OTA_PUSH | command::NETWORK_CONFIG => {
                self.send_uplink(frame.command, frame.msg_id, encode_generic_ack(0))
                    .await
            }
            // Platform acks to register/settlement need no reply.
            _ => Ok(()),
        }
    }

    fn alloc_msg_id(&mut self) -> u32 {
        let id = self.next_msg_id;
        self.next_msg_id = self.next_msg_id.wrapping_add(1).max(1);
        id
    }

    async fn send_uplink(&mut self, cmd: u16, msg_id: u32, payload: Vec<u8>) -> io::Result<()> {
        let frame = Frame::uplink(cmd, msg_id, self.gateway_id, payload);
        self.framed.send(frame).await
    }

    async fn send_register(&mut self) -> io::Result<()> {
        let register = Register {
            firmware: self.cfg.firmware.clone(),
            socket_count: self.cfg.socket_count,
        };
        let msg_id = self.alloc_msg_id();
        self.send_uplink(command::REGISTER, msg_id, register.encode())
            .await
    }

    async fn send_heartbeat(&mut self) -> io::Result<()> {
        let msg_id = self.alloc_msg_id();
        self.send_uplink(command::HEARTBEAT, msg_id, Vec::new()).await
    }

    async fn send_status(&mut self) -> io::Result<()> {
        let readings: Vec<PortReading> = self
            .ports
            .iter()
            .enumerate()
            .map(|(i, slot)| PortReading {
                port_no: i as u8,
                status_bits: slot.status_bits,
                power_w: slot.power_w,
            })
            .collect();
        let msg_id = self.alloc_msg_id();
        self.send_uplink(command::STATUS_REPORT, msg_id, encode_status_report(&readings))
            .await
    }
}
