use crate::vm::events::EventInjection;

/// A virtual processor pinned to a physical one.
#[derive(Debug)]
pub struct Vcpu {
    vcpu_id: u16,
    pcpu_id: u16,
    pending_event: Option<EventInjection>,
}

impl Vcpu {
    pub fn new(vcpu_id: u16, pcpu_id: u16) -> Self {
        Self {
            vcpu_id,
            pcpu_id,
            pending_event: None,
        }
    }

    pub fn vcpu_id(&self) -> u16 {
        self.vcpu_id
    }

    pub fn pcpu_id(&self) -> u16 {
        self.pcpu_id
    }

    /// Queues a general protection fault. It is delivered on the next entry
    /// into the guest and replaces any event that is still pending.
    pub fn inject_gp(&mut self, error_code: u32) {
        log::trace!("vcpu {}: injecting #GP({:#x})", self.vcpu_id, error_code);
        self.pending_event = Some(EventInjection::gp(error_code));
    }

    pub fn pending_event(&self) -> Option<&EventInjection> {
        self.pending_event.as_ref()
    }

    /// Takes the event that has to be written to EVENTINJ before the next
    /// VMRUN.
    pub fn take_pending_event(&mut self) -> Option<EventInjection> {
        self.pending_event.take()
    }
}
