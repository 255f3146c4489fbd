//! Virtual MIDI devices: in-process peers (e.g. an instrument editor UI)
//! that observe note activity and inject events, both over lock-free rings.

use ripieno_core::{ring_buffer, Event, RingConsumer, RingProducer, WallTime};

/// Note activity pushed towards a GUI listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoteNotification {
    NoteOn { key: u8, velocity: u8 },
    NoteOff { key: u8, velocity: u8 },
}

/// Engine-side half, owned by an engine channel.
pub struct VirtualMidiHost {
    notify_tx: RingProducer<NoteNotification>,
    inject_rx: RingConsumer<Event>,
}

impl VirtualMidiHost {
    /// Push a notification; dropped silently when the GUI lags behind.
    pub fn notify(&mut self, notification: NoteNotification) {
        let _ = self.notify_tx.push(notification);
    }

    pub(crate) fn injected(&mut self) -> &mut RingConsumer<Event> {
        &mut self.inject_rx
    }
}

/// Device-side half, handed to the in-process peer.
pub struct VirtualMidiPort {
    notify_rx: RingConsumer<NoteNotification>,
    inject_tx: RingProducer<Event>,
}

impl VirtualMidiPort {
    pub fn send_note_on(&mut self, key: u8, velocity: u8, time: WallTime) -> bool {
        self.inject_tx.push(Event::note_on(key, velocity, time)).is_ok()
    }

    pub fn send_note_off(&mut self, key: u8, velocity: u8, time: WallTime) -> bool {
        self.inject_tx
            .push(Event::note_off(key, velocity, time))
            .is_ok()
    }

    pub fn send_control_change(&mut self, controller: u8, value: u8, time: WallTime) -> bool {
        self.inject_tx
            .push(Event::control_change(controller, value, time))
            .is_ok()
    }

    pub fn next_notification(&mut self) -> Option<NoteNotification> {
        self.notify_rx.pop()
    }
}

/// Create a connected host/port pair.
pub fn virtual_midi_device(capacity: usize) -> (VirtualMidiHost, VirtualMidiPort) {
    let (notify_tx, notify_rx) = ring_buffer(capacity);
    let (inject_tx, inject_rx) = ring_buffer(capacity);
    (
        VirtualMidiHost {
            notify_tx,
            inject_rx,
        },
        VirtualMidiPort {
            notify_rx,
            inject_tx,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_injection_and_notification_roundtrip() {
        let (mut host, mut port) = virtual_midi_device(16);

        assert!(port.send_note_on(60, 100, 123));
        let ev = host.injected().pop().unwrap();
        assert_eq!(ev.note().unwrap().key, 60);
        assert_eq!(ev.time, 123);

        host.notify(NoteNotification::NoteOn {
            key: 60,
            velocity: 100,
        });
        assert_eq!(
            port.next_notification(),
            Some(NoteNotification::NoteOn {
                key: 60,
                velocity: 100
            })
        );
        assert_eq!(port.next_notification(), None);
    }

    #[test]
    fn test_notification_overflow_is_dropped() {
        let (mut host, mut port) = virtual_midi_device(2);
        for _ in 0..5 {
            host.notify(NoteNotification::NoteOff {
                key: 1,
                velocity: 0,
            });
        }
        let mut received = 0;
        while port.next_notification().is_some() {
            received += 1;
        }
        assert_eq!(received, 2);
    }
}
