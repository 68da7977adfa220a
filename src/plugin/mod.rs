/*!

The plugin subsystem: the worker IPC protocol, the subprocess-backed
host, and the FIFO scheduling proxy in front of it. See spec §4.5, §6.2,
§6.3.

 */
pub mod host;
pub mod protocol;
pub mod proxy;
