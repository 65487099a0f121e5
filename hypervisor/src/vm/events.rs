use bitfield::bitfield;

/// Event type of an exception (fault or trap).
const EXCEPTION: u64 = 3;

bitfield! {
    /// See `15.20 Event Injection`.
    ///
    /// Events are injected by setting the VMCB's EVENTINJ field prior to
    /// executing the VMRUN instruction. The guest then takes the specified
    /// exception or interrupt before executing its first instruction.
    ///
    /// ## Fields
    ///
    /// - `Vector`: The 8-bit IDT vector of the interrupt or exception.
    /// - `Type`: 0 = INTR, 2 = NMI, 3 = exception, 4 = software interrupt.
    /// - `Error Code Valid` (`EV`): Set if the exception pushes an error code.
    /// - `Valid`: Set if an event is to be injected.
    /// - `Error Code`: Pushed onto the stack if `EV` is set.
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct EventInjection(u64);
    impl Debug;
    pub get_vector, set_vector: 7, 0;                       // [0-7]
    pub get_type, set_type: 10, 8;                          // [8-10]
    pub get_error_code_valid, set_error_code_valid: 11, 11; // [11]
    // Reserved                                             // [12-30]
    pub get_valid, set_valid: 31, 31;                       // [31]
    pub get_error_code, set_error_code: 63, 32;             // [32-63]
}

impl EventInjection {
    /// See `8 Exceptions and Interrupts > 8.2 Vectors > 8.2.14 #GP`.
    pub fn gp(error_code: u32) -> Self {
        let mut event = EventInjection(0);
        event.set_vector(x86::irq::GENERAL_PROTECTION_FAULT_VECTOR as u64);
        event.set_type(EXCEPTION);
        event.set_error_code_valid(1);
        event.set_error_code(error_code as u64);
        event.set_valid(1);

        event
    }

    /// Raw value of the EVENTINJ field.
    pub fn value(&self) -> u64 {
        self.0
    }
}
