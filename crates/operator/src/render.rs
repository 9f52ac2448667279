//! Rendering of `odoo.conf`.
use std::fmt::Write;

use crate::crd::OdooConfig;
use crate::resolver::ConnectionDescriptor;

/// Produces the configuration file. Output is byte-stable for equal inputs,
/// which keeps the config secret diff empty across passes.
pub fn render(db: &ConnectionDescriptor, config: &OdooConfig, admin_password: &str) -> String {
    let mut out = String::with_capacity(512);
    // Writing into a String cannot fail.
    let _ = write!(
        out,
        "[options]\n\
         admin_passwd = {admin_password}\n\
         data_dir = {data_dir}\n\
         \n\
         db_host = {host}\n\
         db_port = {port}\n\
         db_user = {user}\n\
         db_password = {password}\n\
         db_maxconn = {max_conn}\n\
         db_name = {name}\n\
         \n\
         debug_mode = {debug}\n\
         without_demo = {without_demo}\n\
         proxy_mode = {proxy_mode}\n\
         workers = {workers}\n\
         limit_memory_soft = {soft}\n\
         limit_memory_hard = {hard}\n\
         limit_request = {request}\n\
         limit_time_cpu = {cpu}\n\
         limit_time_real = {real}\n",
        data_dir = config.data_dir,
        host = db.host,
        port = db.port,
        user = db.user,
        password = db.password,
        max_conn = db.max_conn,
        name = db.name,
        debug = config.debug_mode,
        without_demo = config.without_demo,
        proxy_mode = config.proxy_mode,
        workers = config.workers,
        soft = config.limit_memory_soft,
        hard = config.limit_memory_hard,
        request = config.limit_request,
        cpu = config.limit_time_cpu,
        real = config.limit_time_real,
    );
    out
}
