//! Pairing approval on the terminal

use crate::config::ApprovalPolicy;
use async_trait::async_trait;
use pairlink_protocol::pairing::PairingOutcome;
use pairlink_protocol::{DeviceInfo, Fingerprint, PairingDecision, PairingDelegate};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Answers pairing requests according to the configured policy
pub struct PolicyDelegate {
    policy: ApprovalPolicy,
    /// One prompt at a time
    prompt: Mutex<()>,
}

impl PolicyDelegate {
    pub fn new(policy: ApprovalPolicy) -> Self {
        Self {
            policy,
            prompt: Mutex::new(()),
        }
    }

    async fn ask(&self, device: &DeviceInfo, fingerprint: &Fingerprint) -> PairingDecision {
        let _turn = self.prompt.lock().await;

        let question = format!(
            "\nPairing request from {} ({}, {})\nFingerprint: {}\nAccept? [y/N] ",
            device.device_name,
            device.device_type.as_str(),
            device.device_id,
            fingerprint
        );
        let mut stdout = tokio::io::stdout();
        if let Err(e) = stdout.write_all(question.as_bytes()).await {
            warn!("Could not prompt for pairing: {}", e);
            return PairingDecision::Reject;
        }
        let _ = stdout.flush().await;

        let mut line = String::new();
        match BufReader::new(tokio::io::stdin()).read_line(&mut line).await {
            Ok(_) => parse_answer(&line),
            Err(e) => {
                warn!("Could not read pairing answer: {}", e);
                PairingDecision::Reject
            }
        }
    }
}

fn parse_answer(line: &str) -> PairingDecision {
    match line.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => PairingDecision::Accept,
        _ => PairingDecision::Reject,
    }
}

#[async_trait]
impl PairingDelegate for PolicyDelegate {
    async fn on_incoming_pairing_request(
        &self,
        device: &DeviceInfo,
        fingerprint: &Fingerprint,
    ) -> PairingDecision {
        match self.policy {
            ApprovalPolicy::Accept => {
                info!("Accepting pairing with {} by policy", device.device_id);
                PairingDecision::Accept
            }
            ApprovalPolicy::Reject => {
                info!("Rejecting pairing with {} by policy", device.device_id);
                PairingDecision::Reject
            }
            ApprovalPolicy::Prompt => self.ask(device, fingerprint).await,
        }
    }

    async fn on_pairing_result(&self, device: &DeviceInfo, outcome: PairingOutcome) {
        info!(
            "Pairing with {} ({}) ended: {:?}",
            device.device_name, device.device_id, outcome
        );
    }

    async fn on_trust_violation(
        &self,
        device_id: &str,
        expected: &Fingerprint,
        presented: &Fingerprint,
    ) {
        error!(
            "Device {} presented certificate {} but {} is trusted. \
             Run `pairlink-daemon unpair {}` if the device was reinstalled.",
            device_id, presented, expected, device_id
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pairlink_protocol::DeviceType;

    #[test]
    fn test_parse_answer() {
        assert_eq!(parse_answer("y\n"), PairingDecision::Accept);
        assert_eq!(parse_answer(" YES "), PairingDecision::Accept);
        assert_eq!(parse_answer("\n"), PairingDecision::Reject);
        assert_eq!(parse_answer("nope"), PairingDecision::Reject);
    }

    #[tokio::test]
    async fn test_fixed_policies() {
        let device = DeviceInfo::with_id("2000", "phone", DeviceType::Phone, 1739);
        let fingerprint = Fingerprint::from_bytes(vec![1; 32]);

        let accept = PolicyDelegate::new(ApprovalPolicy::Accept);
        assert_eq!(
            accept.on_incoming_pairing_request(&device, &fingerprint).await,
            PairingDecision::Accept
        );

        let reject = PolicyDelegate::new(ApprovalPolicy::Reject);
        assert_eq!(
            reject.on_incoming_pairing_request(&device, &fingerprint).await,
            PairingDecision::Reject
        );
    }
}
