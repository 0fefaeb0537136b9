pub mod sys_conf;
