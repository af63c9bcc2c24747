/// Demo application logic: answer "0" notifications with the next colour
/// from the palette and stop after a fixed number of notifications.
#[derive(Debug, Clone)]
pub struct CommandResponder {
    palette: Vec<u32>,
    limit: u32,
    received: u32,
}

/// What the application should do after a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Response {
    pub write: Option<u32>,
    pub shutdown: bool,
}

impl CommandResponder {
    pub fn new(palette: Vec<u32>, limit: u32) -> Self {
        Self {
            palette,
            limit,
            received: 0,
        }
    }

    pub fn received(&self) -> u32 {
        self.received
    }

    pub fn on_notification(&mut self, value: u8) -> Response {
        let write = if value == 0 {
            let index = (self.received / 2) as usize;
            self.palette.get(index).copied()
        } else {
            None
        };

        self.received += 1;

        Response {
            write,
            shutdown: self.received >= self.limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PALETTE: [u32; 3] = [0xFF00_0080, 0x00FF_0080, 0x0000_FF80];

    #[test]
    fn test_alternating_notifications_cycle_palette_then_stop() {
        let mut responder = CommandResponder::new(PALETTE.to_vec(), 6);
        let responses: Vec<Response> = [0u8, 1, 0, 1, 0, 1]
            .into_iter()
            .map(|value| responder.on_notification(value))
            .collect();

        let writes: Vec<u32> = responses.iter().filter_map(|r| r.write).collect();
        assert_eq!(writes, PALETTE.to_vec());

        assert!(responses[..5].iter().all(|r| !r.shutdown));
        assert!(responses[5].shutdown);
    }

    #[test]
    fn test_palette_overrun_skips_write() {
        let mut responder = CommandResponder::new(vec![0xFF00_0080], 10);
        responder.on_notification(1);
        responder.on_notification(1);
        let response = responder.on_notification(0);

        assert_eq!(response.write, None);
        assert_eq!(responder.received(), 3);
    }
}
