/// Outside Linux ports are never reported busy.
pub fn is_port_open(_port_name: &str) -> bool {
    false
}
