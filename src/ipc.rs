//! Synchronous send/recv rendezvous. See spec §4.9. A sender blocks
//! until a matching receiver is ready to take the message (and vice
//! versa); there is no intermediate buffering.

use alloc::vec::Vec;

use crate::process::{Pid, PID_ANY};

/// A process's IPC/run state. Mirrors the original kernel's
/// `PROC_RUNNING` / `PROC_SENDING` / `PROC_RECEIVING`, plus a scheduler
/// state for processes parked in `waitpid` or `sleep`, which the
/// scheduler also needs to skip over.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IpcState {
    Running,
    Sending { to: Pid },
    Receiving { from: Pid },
    Sleeping,
    Waiting,
}

/// A fixed-size message payload. The spec leaves the exact size
/// unconstrained; this matches the original kernel's small-message
/// rendezvous (bulk transfer goes through shared memory, out of scope
/// here).
pub const MESSAGE_MAX: usize = 256;

#[derive(Clone)]
pub struct Message {
    pub source: Pid,
    pub len: usize,
    pub data: [u8; MESSAGE_MAX],
}

impl Message {
    pub fn new(source: Pid, bytes: &[u8]) -> Self {
        let len = bytes.len().min(MESSAGE_MAX);
        let mut data = [0u8; MESSAGE_MAX];
        data[..len].copy_from_slice(&bytes[..len]);
        Message { source, len, data }
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

/// Per-process IPC bookkeeping the scheduler and `send`/`recv` syscalls
/// consult: who this process is willing to receive from, and anyone
/// already parked waiting to send to it.
pub struct IpcQueue {
    pub waiting_senders: Vec<Pid>,
}

impl IpcQueue {
    pub fn new() -> Self {
        IpcQueue {
            waiting_senders: Vec::new(),
        }
    }
}

/// Send `payload` from `sender` to `dest`. If `dest` is already parked
/// in `recv` waiting on this sender (or on anyone), the message is
/// handed over directly and `sender` never blocks. Otherwise `sender`
/// is parked in `IpcState::Sending` on `dest`'s sender queue and the
/// CPU is given up until a matching `recv` wakes it.
pub fn send(sender: Pid, dest: Pid, payload: &[u8]) {
    let msg = Message::new(sender, payload);

    let delivered = crate::scheduler::with_process_table(|table| {
        let matches_waiting_receiver = table
            .process_from_pid_ref(dest)
            .map(|p| matches!(p.ipc, IpcState::Receiving { from } if from == PID_ANY || from == sender))
            .unwrap_or(false);

        if matches_waiting_receiver {
            if let Some(dest_proc) = table.process_from_pid(dest) {
                dest_proc.pending_message = Some(msg.clone());
                dest_proc.ipc = IpcState::Running;
            }
            true
        } else {
            if let Some(sender_proc) = table.process_from_pid(sender) {
                sender_proc.ipc = IpcState::Sending { to: dest };
                sender_proc.pending_message = Some(msg.clone());
            }
            if let Some(dest_proc) = table.process_from_pid(dest) {
                dest_proc.ipc_queue.waiting_senders.push(sender);
            }
            false
        }
    });

    if delivered {
        crate::scheduler::enqueue_ready(dest);
    } else {
        // Parked as a waiting sender; resumed once a matching `recv`
        // pulls us off `dest`'s queue and sets us back to `Running`.
        crate::scheduler::switch_task(true);
    }
}

/// Receive a message addressed to `receiver`, optionally restricted to
/// a specific `from` pid (`PID_ANY` accepts the first waiting sender).
/// If a sender is already parked waiting, the message is taken
/// immediately; otherwise `receiver` blocks in `IpcState::Receiving`
/// until a `send` call delivers one.
pub fn recv(receiver: Pid, from: Pid) -> Message {
    let immediate = crate::scheduler::with_process_table(|table| {
        let sender_pid = match table.process_from_pid(receiver) {
            Some(proc) => {
                let idx = proc
                    .ipc_queue
                    .waiting_senders
                    .iter()
                    .position(|&s| from == PID_ANY || s == from);
                idx.map(|i| proc.ipc_queue.waiting_senders.remove(i))
            }
            None => None,
        };

        let sender_pid = match sender_pid {
            Some(pid) => pid,
            None => return None,
        };

        let msg = table
            .process_from_pid(sender_pid)
            .and_then(|sender_proc| sender_proc.pending_message.take());
        if let Some(sender_proc) = table.process_from_pid(sender_pid) {
            sender_proc.ipc = IpcState::Running;
        }
        msg.map(|m| (sender_pid, m))
    });

    if let Some((sender_pid, msg)) = immediate {
        crate::scheduler::enqueue_ready(sender_pid);
        return msg;
    }

    crate::scheduler::with_process_table(|table| {
        if let Some(proc) = table.process_from_pid(receiver) {
            proc.ipc = IpcState::Receiving { from };
        }
    });
    crate::scheduler::switch_task(true);

    crate::scheduler::with_process_table(|table| {
        table
            .process_from_pid(receiver)
            .and_then(|p| p.pending_message.take())
    })
    .expect("recv: woke with no pending message delivered")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_truncates_to_max_len() {
        let big = [7u8; MESSAGE_MAX + 16];
        let m = Message::new(1, &big);
        assert_eq!(m.len, MESSAGE_MAX);
        assert_eq!(m.payload().len(), MESSAGE_MAX);
    }

    #[test]
    fn message_round_trips_short_payload() {
        let m = Message::new(3, b"hello");
        assert_eq!(m.payload(), b"hello");
    }

    #[test]
    fn send_delivers_directly_to_a_waiting_receiver() {
        let kernel = crate::memory::paging::PageDirectory::empty(0x1000);
        let init = crate::scheduler::with_process_table(|t| t.spawn_init("init", &kernel, 0x2000));
        let dir = crate::memory::paging::PageDirectory::new_with_kernel_base(&kernel, 0x3000);
        let receiver = crate::scheduler::with_process_table(|t| t.spawn_process("recv", init, dir));

        crate::scheduler::with_process_table(|t| {
            t.process_from_pid(receiver).unwrap().ipc = IpcState::Receiving { from: PID_ANY };
        });

        send(init, receiver, b"hi");

        crate::scheduler::with_process_table(|t| {
            let proc = t.process_from_pid(receiver).unwrap();
            assert!(matches!(proc.ipc, IpcState::Running));
            assert_eq!(proc.pending_message.as_ref().unwrap().payload(), b"hi");
        });
    }

    #[test]
    fn recv_takes_an_already_waiting_sender_without_blocking() {
        let kernel = crate::memory::paging::PageDirectory::empty(0x1000);
        let init = crate::scheduler::with_process_table(|t| t.spawn_init("init", &kernel, 0x2000));
        let dir = crate::memory::paging::PageDirectory::new_with_kernel_base(&kernel, 0x3000);
        let sender = crate::scheduler::with_process_table(|t| t.spawn_process("send", init, dir));

        crate::scheduler::with_process_table(|t| {
            let proc = t.process_from_pid(sender).unwrap();
            proc.ipc = IpcState::Sending { to: init };
            proc.pending_message = Some(Message::new(sender, b"ping"));
        });
        crate::scheduler::with_process_table(|t| {
            t.process_from_pid(init).unwrap().ipc_queue.waiting_senders.push(sender);
        });

        let msg = recv(init, PID_ANY);

        assert_eq!(msg.payload(), b"ping");
        crate::scheduler::with_process_table(|t| {
            let proc = t.process_from_pid(sender).unwrap();
            assert!(matches!(proc.ipc, IpcState::Running));
            assert!(proc.pending_message.is_none());
        });
    }
}
